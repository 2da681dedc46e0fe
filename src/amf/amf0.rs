//! AMF0 encoder and decoder
//!
//! ```text
//! 0x00 Number        f64 big-endian
//! 0x01 Boolean       u8
//! 0x02 String        u16 length + UTF-8
//! 0x03 Object        (u16 key, value)* 0x00 0x00 0x09
//! 0x05 Null
//! 0x06 Undefined
//! 0x07 Reference     u16 index into previously decoded complex values
//! 0x08 ECMA Array    u32 count hint + object body
//! 0x0A Strict Array  u32 count + values
//! 0x0B Date          f64 + i16 timezone
//! 0x0C Long String   u32 length + UTF-8
//! 0x0D Unsupported
//! 0x0F XML Document  u32 length + UTF-8
//! 0x10 Typed Object  u16 class name + object body
//! 0x11 AVM+          switch to AMF3 (not supported, decoded as Undefined)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::{AmfObject, AmfValue};
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_REFERENCE: u8 = 0x07;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;
const MARKER_UNSUPPORTED: u8 = 0x0D;
const MARKER_XML_DOCUMENT: u8 = 0x0F;
const MARKER_TYPED_OBJECT: u8 = 0x10;
const MARKER_AVMPLUS: u8 = 0x11;

/// Guards against stack exhaustion from hostile payloads
const MAX_NESTING_DEPTH: usize = 64;

/// Stateful AMF0 decoder
///
/// Holds the reference table for one message; create a fresh decoder (or
/// call [`Amf0Decoder::reset`]) per message.
pub struct Amf0Decoder {
    references: Vec<AmfValue>,
    lenient: bool,
    depth: usize,
}

impl Amf0Decoder {
    /// Lenient decoder: unknown markers become `Undefined` and a missing
    /// object end marker at the end of the buffer is tolerated
    pub fn new() -> Self {
        Self::with_lenient(true)
    }

    pub fn with_lenient(lenient: bool) -> Self {
        Self {
            references: Vec::new(),
            lenient,
            depth: 0,
        }
    }

    pub fn reset(&mut self) {
        self.references.clear();
        self.depth = 0;
    }

    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if !buf.has_remaining() {
            return Err(AmfError::UnexpectedEof);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(AmfError::NestingTooDeep);
        }

        let marker = buf.get_u8();
        let value = self.decode_marker(marker, buf);
        self.depth -= 1;
        value
    }

    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_marker(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => {
                need(buf, 8)?;
                Ok(AmfValue::Number(buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                need(buf, 1)?;
                Ok(AmfValue::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => read_short_string(buf).map(AmfValue::String),
            MARKER_LONG_STRING => read_long_string(buf).map(AmfValue::String),
            MARKER_XML_DOCUMENT => read_long_string(buf).map(AmfValue::Xml),
            MARKER_OBJECT => {
                let slot = self.reserve_reference();
                let obj = AmfValue::Object(self.read_properties(buf)?);
                self.references[slot] = obj.clone();
                Ok(obj)
            }
            MARKER_TYPED_OBJECT => {
                // Class names carry no meaning for RTMP commands
                let _class_name = read_short_string(buf)?;
                let slot = self.reserve_reference();
                let obj = AmfValue::Object(self.read_properties(buf)?);
                self.references[slot] = obj.clone();
                Ok(obj)
            }
            MARKER_ECMA_ARRAY => {
                need(buf, 4)?;
                // Count is a hint only; encoders get it wrong regularly
                let _count = buf.get_u32();
                let slot = self.reserve_reference();
                let arr = AmfValue::EcmaArray(self.read_properties(buf)?);
                self.references[slot] = arr.clone();
                Ok(arr)
            }
            MARKER_STRICT_ARRAY => {
                need(buf, 4)?;
                let count = buf.get_u32() as usize;
                let slot = self.reserve_reference();
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(self.decode(buf)?);
                }
                let arr = AmfValue::StrictArray(items);
                self.references[slot] = arr.clone();
                Ok(arr)
            }
            MARKER_DATE => {
                need(buf, 10)?;
                let millis = buf.get_f64();
                let _timezone = buf.get_i16();
                Ok(AmfValue::Date(millis))
            }
            MARKER_REFERENCE => {
                need(buf, 2)?;
                let index = buf.get_u16();
                self.references
                    .get(index as usize)
                    .cloned()
                    .ok_or(AmfError::InvalidReference(index))
            }
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED | MARKER_UNSUPPORTED | MARKER_AVMPLUS => Ok(AmfValue::Undefined),
            other if self.lenient => {
                tracing::trace!(marker = other, "Skipping unknown AMF0 marker");
                Ok(AmfValue::Undefined)
            }
            other => Err(AmfError::UnknownMarker(other)),
        }
    }

    fn reserve_reference(&mut self) -> usize {
        self.references.push(AmfValue::Null);
        self.references.len() - 1
    }

    fn read_properties(&mut self, buf: &mut Bytes) -> Result<AmfObject, AmfError> {
        let mut obj = AmfObject::new();
        loop {
            // OBS has been seen to drop the trailing end marker on the last object
            if self.lenient && !buf.has_remaining() {
                return Ok(obj);
            }

            let key = read_short_string(buf)?;
            if key.is_empty() {
                if !buf.has_remaining() {
                    return if self.lenient {
                        Ok(obj)
                    } else {
                        Err(AmfError::UnexpectedEof)
                    };
                }
                if buf.chunk()[0] == MARKER_OBJECT_END {
                    buf.advance(1);
                    return Ok(obj);
                }
                if !self.lenient {
                    return Err(AmfError::InvalidObjectEnd);
                }
            }

            let value = self.decode(buf)?;
            obj.insert(key, value);
        }
    }
}

impl Default for Amf0Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn need(buf: &Bytes, n: usize) -> Result<(), AmfError> {
    if buf.remaining() < n {
        Err(AmfError::UnexpectedEof)
    } else {
        Ok(())
    }
}

fn read_short_string(buf: &mut Bytes) -> Result<String, AmfError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    read_utf8(buf, len)
}

fn read_long_string(buf: &mut Bytes) -> Result<String, AmfError> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    read_utf8(buf, len)
}

fn read_utf8(buf: &mut Bytes, len: usize) -> Result<String, AmfError> {
    need(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// Append the AMF0 encoding of `value` to `out`
pub fn encode_value(value: &AmfValue, out: &mut BytesMut) {
    match value {
        AmfValue::Number(n) => {
            out.put_u8(MARKER_NUMBER);
            out.put_f64(*n);
        }
        AmfValue::Boolean(b) => {
            out.put_u8(MARKER_BOOLEAN);
            out.put_u8(*b as u8);
        }
        AmfValue::String(s) if s.len() > u16::MAX as usize => {
            out.put_u8(MARKER_LONG_STRING);
            out.put_u32(s.len() as u32);
            out.put_slice(s.as_bytes());
        }
        AmfValue::String(s) => {
            out.put_u8(MARKER_STRING);
            write_key(s, out);
        }
        AmfValue::Object(obj) => {
            out.put_u8(MARKER_OBJECT);
            write_properties(obj, out);
        }
        AmfValue::Null => out.put_u8(MARKER_NULL),
        AmfValue::Undefined => out.put_u8(MARKER_UNDEFINED),
        AmfValue::EcmaArray(obj) => {
            out.put_u8(MARKER_ECMA_ARRAY);
            out.put_u32(obj.len() as u32);
            write_properties(obj, out);
        }
        AmfValue::StrictArray(items) => {
            out.put_u8(MARKER_STRICT_ARRAY);
            out.put_u32(items.len() as u32);
            for item in items {
                encode_value(item, out);
            }
        }
        AmfValue::Date(millis) => {
            out.put_u8(MARKER_DATE);
            out.put_f64(*millis);
            out.put_i16(0);
        }
        AmfValue::Xml(s) => {
            out.put_u8(MARKER_XML_DOCUMENT);
            out.put_u32(s.len() as u32);
            out.put_slice(s.as_bytes());
        }
    }
}

fn write_key(s: &str, out: &mut BytesMut) {
    let len = s.len().min(u16::MAX as usize);
    out.put_u16(len as u16);
    out.put_slice(&s.as_bytes()[..len]);
}

fn write_properties(obj: &AmfObject, out: &mut BytesMut) {
    for (key, value) in obj.iter() {
        write_key(key, out);
        encode_value(value, out);
    }
    out.put_u16(0);
    out.put_u8(MARKER_OBJECT_END);
}

/// Encode a sequence of values into a fresh buffer
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut out = BytesMut::with_capacity(128);
    for value in values {
        encode_value(value, &mut out);
    }
    out.freeze()
}

/// Decode every value in `data` with a lenient decoder
pub fn decode_all(data: &Bytes) -> Result<Vec<AmfValue>, AmfError> {
    let mut buf = data.clone();
    Amf0Decoder::new().decode_all(&mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: AmfValue) -> AmfValue {
        let encoded = encode_all(std::slice::from_ref(&value));
        let mut decoded = decode_all(&encoded).unwrap();
        assert_eq!(decoded.len(), 1);
        decoded.remove(0)
    }

    #[test]
    fn test_connect_command_roundtrip() {
        let cmd_obj = AmfObject::new()
            .with("app", "live")
            .with("type", "nonprivate")
            .with("flashVer", "FMLE/3.0 (compatible; FMSc/1.0)")
            .with("tcUrl", "rtmp://localhost/live")
            .with("fpad", false)
            .with("audioCodecs", 3575.0)
            .with("objectEncoding", 0.0);

        let values = vec![
            AmfValue::String("connect".into()),
            AmfValue::Number(1.0),
            AmfValue::Object(cmd_obj),
        ];

        let encoded = encode_all(&values);
        let decoded = decode_all(&encoded).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_metadata_ecma_array() {
        let meta = AmfValue::EcmaArray(
            AmfObject::new()
                .with("width", 1920.0)
                .with("height", 1080.0)
                .with("encoder", "obs-output module"),
        );
        assert_eq!(roundtrip(meta.clone()), meta);
    }

    #[test]
    fn test_long_string_marker() {
        let long = "x".repeat(70_000);
        let encoded = encode_all(&[AmfValue::String(long.clone())]);
        assert_eq!(encoded[0], MARKER_LONG_STRING);
        assert_eq!(roundtrip(AmfValue::String(long.clone())), AmfValue::String(long));
    }

    #[test]
    fn test_strict_array_and_date() {
        let arr = AmfValue::StrictArray(vec![
            AmfValue::Number(1.0),
            AmfValue::Null,
            AmfValue::Date(1_700_000_000_000.0),
        ]);
        assert_eq!(roundtrip(arr.clone()), arr);
    }

    #[test]
    fn test_typed_object_decodes_as_object() {
        let mut raw = BytesMut::new();
        raw.put_u8(MARKER_TYPED_OBJECT);
        write_key("flash.Point", &mut raw);
        write_key("x", &mut raw);
        encode_value(&AmfValue::Number(3.0), &mut raw);
        raw.put_u16(0);
        raw.put_u8(MARKER_OBJECT_END);

        let decoded = decode_all(&raw.freeze()).unwrap();
        assert_eq!(decoded[0].get_number("x"), Some(3.0));
    }

    #[test]
    fn test_reference_resolves_earlier_object() {
        let mut raw = BytesMut::new();
        encode_value(&AmfValue::Object(AmfObject::new().with("k", "v")), &mut raw);
        raw.put_u8(MARKER_REFERENCE);
        raw.put_u16(0);

        let decoded = decode_all(&raw.freeze()).unwrap();
        assert_eq!(decoded[0], decoded[1]);
    }

    #[test]
    fn test_bad_reference_rejected() {
        let data = Bytes::from_static(&[MARKER_REFERENCE, 0x00, 0x04]);
        assert_eq!(decode_all(&data), Err(AmfError::InvalidReference(4)));
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(
            decode_all(&Bytes::from_static(&[MARKER_NUMBER, 0x40])),
            Err(AmfError::UnexpectedEof)
        );
        assert_eq!(
            decode_all(&Bytes::from_static(&[MARKER_STRING, 0x00, 0x10, b'a'])),
            Err(AmfError::UnexpectedEof)
        );
    }

    #[test]
    fn test_missing_object_end_is_tolerated() {
        let mut raw = BytesMut::new();
        raw.put_u8(MARKER_OBJECT);
        write_key("app", &mut raw);
        encode_value(&AmfValue::String("live".into()), &mut raw);

        let decoded = decode_all(&raw.freeze()).unwrap();
        assert_eq!(decoded[0].get_str("app"), Some("live"));
    }

    #[test]
    fn test_unknown_marker_lenient_vs_strict() {
        let data = Bytes::from_static(&[0xFE]);
        assert_eq!(decode_all(&data).unwrap(), vec![AmfValue::Undefined]);

        let mut buf = data.clone();
        let err = Amf0Decoder::with_lenient(false).decode(&mut buf);
        assert_eq!(err, Err(AmfError::UnknownMarker(0xFE)));
    }

    #[test]
    fn test_nesting_limit() {
        let mut value = AmfValue::Object(AmfObject::new());
        for _ in 0..(MAX_NESTING_DEPTH + 4) {
            value = AmfValue::Object(AmfObject::new().with("inner", value));
        }
        let encoded = encode_all(&[value]);
        assert_eq!(decode_all(&encoded), Err(AmfError::NestingTooDeep));
    }

    #[test]
    fn test_invalid_utf8() {
        let data = Bytes::from_static(&[MARKER_STRING, 0x00, 0x02, 0xC3, 0x28]);
        assert_eq!(decode_all(&data), Err(AmfError::InvalidUtf8));
    }
}
