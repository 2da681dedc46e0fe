//! Chunk stream codec
//!
//! RTMP messages are split into chunks no larger than the negotiated chunk
//! size. Each chunk starts with a basic header naming its chunk stream and a
//! message header whose size depends on the format:
//!
//! ```text
//! +-------------+----------------+--------------------+--------------+
//! | Basic Header| Message Header | Extended Timestamp |  Chunk Data  |
//! |  1-3 bytes  |  0/3/7/11 bytes|     0 or 4 bytes   |   variable   |
//! +-------------+----------------+--------------------+--------------+
//!
//! fmt 0: timestamp(3) length(3) type(1) stream id(4, little endian)
//! fmt 1: delta(3) length(3) type(1)
//! fmt 2: delta(3)
//! fmt 3: nothing, everything comes from the previous chunk on the stream
//! ```
//!
//! [`ChunkDecoder`] and [`ChunkEncoder`] plug into `tokio_util::codec`'s
//! `FramedRead`/`FramedWrite`; one item is one whole message.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::constants::*;

/// A complete RTMP message together with the chunk stream it travelled on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpChunk {
    pub csid: u32,
    /// Absolute timestamp in milliseconds
    pub timestamp: u32,
    pub message_type: u8,
    /// Message stream id
    pub stream_id: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, Default)]
struct MessageHeader {
    timestamp: u32,
    delta: u32,
    length: u32,
    message_type: u8,
    stream_id: u32,
    extended: bool,
}

#[derive(Debug, Default)]
struct InboundStream {
    header: Option<MessageHeader>,
    partial: Option<BytesMut>,
}

enum Step {
    NeedMore,
    Partial,
    Message(RtmpChunk),
}

/// Reassembles chunks into messages
#[derive(Debug)]
pub struct ChunkDecoder {
    chunk_size: u32,
    max_message_size: usize,
    streams: HashMap<u32, InboundStream>,
    bytes_consumed: u64,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            streams: HashMap::new(),
            bytes_consumed: 0,
        }
    }

    /// Reject messages that declare a length above `limit`
    pub fn max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    /// Current receive chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Total bytes taken off the wire so far, for acknowledgements
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    fn step(&mut self, src: &mut BytesMut) -> Result<Step> {
        let buf = &src[..];
        if buf.is_empty() {
            return Ok(Step::NeedMore);
        }

        let fmt = buf[0] >> 6;
        let (csid, mut pos) = match buf[0] & 0x3F {
            0 if buf.len() < 2 => return Ok(Step::NeedMore),
            0 => (64 + buf[1] as u32, 2),
            1 if buf.len() < 3 => return Ok(Step::NeedMore),
            1 => (64 + buf[1] as u32 + (buf[2] as u32) * 256, 3),
            n => (n as u32, 1),
        };

        let header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if buf.len() < pos + header_len {
            return Ok(Step::NeedMore);
        }

        let (prev, in_flight) = match self.streams.get(&csid) {
            Some(s) => (s.header, s.partial.as_ref().map(|p| p.len())),
            None => (None, None),
        };
        if fmt != 0 && prev.is_none() {
            return Err(ProtocolError::MissingPreviousHeader(csid).into());
        }
        if fmt < 3 && in_flight.is_some() {
            return Err(ProtocolError::InterleavedHeader(csid).into());
        }

        let h = &buf[pos..pos + header_len];
        pos += header_len;

        let mut header = prev.unwrap_or_default();
        let ts_field = if fmt < 3 { read_u24(&h[0..3]) } else { 0 };
        if fmt <= 1 {
            header.length = read_u24(&h[3..6]);
            header.message_type = h[6];
        }
        if fmt == 0 {
            header.stream_id = u32::from_le_bytes([h[7], h[8], h[9], h[10]]);
        }

        let extended = if fmt < 3 {
            ts_field == EXTENDED_TIMESTAMP_THRESHOLD
        } else {
            header.extended
        };
        let mut ext_value = 0;
        if extended {
            if buf.len() < pos + 4 {
                return Ok(Step::NeedMore);
            }
            ext_value = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
            pos += 4;
        }

        let new_message = in_flight.is_none();
        if fmt < 3 {
            let field = if extended { ext_value } else { ts_field };
            header.timestamp = if fmt == 0 {
                field
            } else {
                header.timestamp.wrapping_add(field)
            };
            header.delta = field;
            header.extended = extended;
        } else if new_message {
            header.timestamp = header.timestamp.wrapping_add(header.delta);
        }

        let length = header.length as usize;
        if new_message && length > self.max_message_size {
            return Err(Error::ResourceLimitExceeded {
                size: length,
                limit: self.max_message_size,
            });
        }

        let have = in_flight.unwrap_or(0);
        let take = (length - have).min(self.chunk_size as usize);
        if buf.len() < pos + take {
            return Ok(Step::NeedMore);
        }

        // Commit: the whole chunk is present
        let mut data = src.split_to(pos + take);
        data.advance(pos);
        self.bytes_consumed += (pos + take) as u64;

        let stream = self.streams.entry(csid).or_default();
        stream.header = Some(header);

        let payload = if new_message && take == length {
            data.freeze()
        } else {
            let partial = stream
                .partial
                .get_or_insert_with(|| BytesMut::with_capacity(length));
            partial.extend_from_slice(&data);
            if partial.len() < length {
                return Ok(Step::Partial);
            }
            match stream.partial.take() {
                Some(p) => p.freeze(),
                None => Bytes::new(),
            }
        };

        let chunk = RtmpChunk {
            csid,
            timestamp: header.timestamp,
            message_type: header.message_type,
            stream_id: header.stream_id,
            payload,
        };
        self.apply_control(&chunk)?;
        Ok(Step::Message(chunk))
    }

    /// Protocol control that changes how the following bytes are parsed
    fn apply_control(&mut self, chunk: &RtmpChunk) -> Result<()> {
        match chunk.message_type {
            MSG_SET_CHUNK_SIZE => {
                let size = read_u32_payload(chunk)?;
                if size == 0 || size > MAX_PEER_CHUNK_SIZE {
                    return Err(ProtocolError::InvalidChunkSize(size).into());
                }
                tracing::trace!(size, "Peer chunk size applied");
                self.chunk_size = size;
            }
            MSG_ABORT => {
                let csid = read_u32_payload(chunk)?;
                if let Some(stream) = self.streams.get_mut(&csid) {
                    stream.partial = None;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkDecoder {
    type Item = RtmpChunk;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RtmpChunk>> {
        loop {
            match self.step(src)? {
                Step::NeedMore => return Ok(None),
                Step::Partial => continue,
                Step::Message(chunk) => return Ok(Some(chunk)),
            }
        }
    }
}

fn read_u24(b: &[u8]) -> u32 {
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32
}

fn read_u32_payload(chunk: &RtmpChunk) -> Result<u32> {
    if chunk.payload.len() < 4 {
        return Err(ProtocolError::MalformedMessage {
            message_type: chunk.message_type,
            reason: "payload shorter than 4 bytes",
        }
        .into());
    }
    let p = &chunk.payload;
    Ok(u32::from_be_bytes([p[0], p[1], p[2], p[3]]))
}

#[derive(Debug, Clone, Copy)]
struct OutboundStream {
    timestamp: u32,
    /// Unknown right after a type 0 header
    delta: Option<u32>,
    length: u32,
    message_type: u8,
    stream_id: u32,
    extended: bool,
}

/// Splits messages into chunks, compressing headers per chunk stream
#[derive(Debug)]
pub struct ChunkEncoder {
    chunk_size: u32,
    streams: HashMap<u32, OutboundStream>,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    /// Takes effect for the next message; announce it to the peer first
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    fn encode_chunk(&mut self, msg: &RtmpChunk, dst: &mut BytesMut) -> Result<()> {
        let length = msg.payload.len();
        if length > MAX_CHUNK_SIZE as usize {
            return Err(Error::ResourceLimitExceeded {
                size: length,
                limit: MAX_CHUNK_SIZE as usize,
            });
        }
        let length = length as u32;

        let prev = self.streams.get(&msg.csid).copied();
        let (fmt, field) = match prev {
            Some(p) if p.stream_id == msg.stream_id && msg.timestamp >= p.timestamp => {
                let delta = msg.timestamp - p.timestamp;
                if p.length != length || p.message_type != msg.message_type {
                    (1, delta)
                } else if p.delta == Some(delta) {
                    (3, delta)
                } else {
                    (2, delta)
                }
            }
            _ => (0, msg.timestamp),
        };

        let extended = match (fmt, prev) {
            (3, Some(p)) => p.extended,
            _ => field >= EXTENDED_TIMESTAMP_THRESHOLD,
        };

        write_basic_header(dst, fmt, msg.csid);
        if fmt < 3 {
            let ts = if extended {
                EXTENDED_TIMESTAMP_THRESHOLD
            } else {
                field
            };
            put_u24(dst, ts);
            if fmt <= 1 {
                put_u24(dst, length);
                dst.put_u8(msg.message_type);
            }
            if fmt == 0 {
                dst.put_u32_le(msg.stream_id);
            }
        }
        if extended {
            dst.put_u32(field);
        }

        let chunk_size = self.chunk_size as usize;
        let mut payload = &msg.payload[..];
        let first = payload.len().min(chunk_size);
        dst.put_slice(&payload[..first]);
        payload = &payload[first..];

        while !payload.is_empty() {
            write_basic_header(dst, 3, msg.csid);
            if extended {
                dst.put_u32(field);
            }
            let n = payload.len().min(chunk_size);
            dst.put_slice(&payload[..n]);
            payload = &payload[n..];
        }

        self.streams.insert(
            msg.csid,
            OutboundStream {
                timestamp: msg.timestamp,
                delta: if fmt == 0 { None } else { Some(field) },
                length,
                message_type: msg.message_type,
                stream_id: msg.stream_id,
                extended,
            },
        );
        Ok(())
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<RtmpChunk> for ChunkEncoder {
    type Error = Error;

    fn encode(&mut self, item: RtmpChunk, dst: &mut BytesMut) -> Result<()> {
        self.encode_chunk(&item, dst)
    }
}

fn write_basic_header(dst: &mut BytesMut, fmt: u8, csid: u32) {
    let fmt = fmt << 6;
    if (2..64).contains(&csid) {
        dst.put_u8(fmt | csid as u8);
    } else if (64..320).contains(&csid) {
        dst.put_u8(fmt);
        dst.put_u8((csid - 64) as u8);
    } else {
        let id = csid.clamp(320, MAX_CSID) - 64;
        dst.put_u8(fmt | 1);
        dst.put_u8((id & 0xFF) as u8);
        dst.put_u8((id >> 8) as u8);
    }
}

fn put_u24(dst: &mut BytesMut, v: u32) {
    dst.put_u8((v >> 16) as u8);
    dst.put_u8((v >> 8) as u8);
    dst.put_u8(v as u8);
}
