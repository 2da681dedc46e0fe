//! RTMP message types
//!
//! Maps reassembled chunks to typed messages and back. Audio and video
//! payloads are carried as opaque FLV tag bodies; nothing here inspects
//! codec data beyond what the registry needs to classify packets.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{self, Amf0Decoder, AmfObject, AmfValue};
use crate::error::{ProtocolError, Result};
use crate::protocol::chunk::RtmpChunk;
use crate::protocol::constants::*;

/// User control (type 4) events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    Unknown { event_type: u16, data: Bytes },
}

impl UserControlEvent {
    fn parse(mut payload: Bytes) -> Result<Self> {
        if payload.len() < 6 {
            return Err(malformed(MSG_USER_CONTROL, "user control shorter than 6 bytes"));
        }
        let event_type = payload.get_u16();
        let value = payload.get_u32();
        Ok(match event_type {
            UC_STREAM_BEGIN => UserControlEvent::StreamBegin(value),
            UC_STREAM_EOF => UserControlEvent::StreamEof(value),
            UC_STREAM_DRY => UserControlEvent::StreamDry(value),
            UC_SET_BUFFER_LENGTH if payload.len() >= 4 => UserControlEvent::SetBufferLength {
                stream_id: value,
                buffer_ms: payload.get_u32(),
            },
            UC_STREAM_IS_RECORDED => UserControlEvent::StreamIsRecorded(value),
            UC_PING_REQUEST => UserControlEvent::PingRequest(value),
            UC_PING_RESPONSE => UserControlEvent::PingResponse(value),
            _ => {
                let mut data = BytesMut::with_capacity(4 + payload.len());
                data.put_u32(value);
                data.put_slice(&payload);
                UserControlEvent::Unknown {
                    event_type,
                    data: data.freeze(),
                }
            }
        })
    }

    fn write(&self, out: &mut BytesMut) {
        let (event_type, value) = match self {
            UserControlEvent::StreamBegin(id) => (UC_STREAM_BEGIN, *id),
            UserControlEvent::StreamEof(id) => (UC_STREAM_EOF, *id),
            UserControlEvent::StreamDry(id) => (UC_STREAM_DRY, *id),
            UserControlEvent::SetBufferLength {
                stream_id,
                buffer_ms,
            } => {
                out.put_u16(UC_SET_BUFFER_LENGTH);
                out.put_u32(*stream_id);
                out.put_u32(*buffer_ms);
                return;
            }
            UserControlEvent::StreamIsRecorded(id) => (UC_STREAM_IS_RECORDED, *id),
            UserControlEvent::PingRequest(ts) => (UC_PING_REQUEST, *ts),
            UserControlEvent::PingResponse(ts) => (UC_PING_RESPONSE, *ts),
            UserControlEvent::Unknown { event_type, data } => {
                out.put_u16(*event_type);
                out.put_slice(data);
                return;
            }
        };
        out.put_u16(event_type);
        out.put_u32(value);
    }
}

/// An AMF command (`connect`, `publish`, `_result`, `onStatus`, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub command_object: AmfValue,
    pub arguments: Vec<AmfValue>,
    /// Message stream the command arrived on or is sent to
    pub stream_id: u32,
}

impl Command {
    pub fn new(
        name: impl Into<String>,
        transaction_id: f64,
        command_object: AmfValue,
        arguments: Vec<AmfValue>,
    ) -> Self {
        Self {
            name: name.into(),
            transaction_id,
            command_object,
            arguments,
            stream_id: 0,
        }
    }

    /// Send on a specific message stream
    pub fn on_stream(mut self, stream_id: u32) -> Self {
        self.stream_id = stream_id;
        self
    }

    pub fn result(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Self::new(CMD_RESULT, transaction_id, properties, vec![info])
    }

    pub fn error(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Self::new(CMD_ERROR, transaction_id, properties, vec![info])
    }

    /// `onStatus` notification on a message stream
    pub fn on_status(stream_id: u32, level: &str, code: &str, description: &str) -> Self {
        let info = AmfObject::new()
            .with("level", level)
            .with("code", code)
            .with("description", description);
        Self::new(CMD_ON_STATUS, 0.0, AmfValue::Null, vec![info.into()]).on_stream(stream_id)
    }

    /// First argument as a string (stream names for publish/play/FCPublish)
    pub fn first_string_argument(&self) -> Option<&str> {
        self.arguments.first().and_then(|v| v.as_str())
    }

    /// `code` of an `onStatus`/`_result`/`_error` info object
    pub fn status_code(&self) -> Option<&str> {
        self.arguments.iter().find_map(|v| v.get_str("code"))
    }

    /// `level` of an `onStatus` info object
    pub fn status_level(&self) -> Option<&str> {
        self.arguments.iter().find_map(|v| v.get_str("level"))
    }

    fn parse(payload: Bytes, message_type: u8, stream_id: u32, timestamp: u32) -> Result<Self> {
        let mut values = amf::decode_all(&payload)?.into_iter();
        let name = match values.next() {
            Some(AmfValue::String(name)) => name,
            _ => return Err(malformed(message_type, "command without a name")),
        };
        let transaction_id = values.next().and_then(|v| v.as_number()).unwrap_or(0.0);
        let command_object = values.next().unwrap_or(AmfValue::Null);
        Ok(Self {
            name,
            transaction_id,
            command_object,
            arguments: values.collect(),
            stream_id,
        })
    }

    fn write(&self, out: &mut BytesMut) {
        amf::encode_value(&AmfValue::String(self.name.clone()), out);
        amf::encode_value(&AmfValue::Number(self.transaction_id), out);
        amf::encode_value(&self.command_object, out);
        for arg in &self.arguments {
            amf::encode_value(arg, out);
        }
    }
}

/// A data message (`@setDataFrame`, `onMetaData`, ...)
///
/// The raw payload is kept so metadata can be forwarded byte for byte.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub name: String,
    pub stream_id: u32,
    pub timestamp: u32,
    /// Everything after the name
    pub body: Bytes,
    pub payload: Bytes,
}

impl DataMessage {
    fn parse(payload: Bytes, message_type: u8, stream_id: u32, timestamp: u32) -> Result<Self> {
        let mut rest = payload.clone();
        let name = match Amf0Decoder::new().decode(&mut rest)? {
            AmfValue::String(name) => name,
            _ => return Err(malformed(message_type, "data message without a name")),
        };
        Ok(Self {
            name,
            stream_id,
            timestamp,
            body: rest,
            payload,
        })
    }

    /// `onMetaData` payload with any `@setDataFrame` wrapper removed
    pub fn metadata(&self) -> Option<Bytes> {
        match self.name.as_str() {
            CMD_ON_METADATA => Some(self.payload.clone()),
            CMD_SET_DATA_FRAME => {
                let mut rest = self.body.clone();
                match Amf0Decoder::new().decode(&mut rest) {
                    Ok(AmfValue::String(inner)) if inner == CMD_ON_METADATA => {
                        Some(self.body.clone())
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Decoded values after the name
    pub fn values(&self) -> Result<Vec<AmfValue>> {
        Ok(amf::decode_all(&self.body)?)
    }
}

/// Re-wrap an `onMetaData` payload the way publishers send it
pub fn set_data_frame(metadata: &Bytes) -> Bytes {
    let mut out = BytesMut::with_capacity(metadata.len() + 16);
    amf::encode_value(&AmfValue::String(CMD_SET_DATA_FRAME.into()), &mut out);
    out.put_slice(metadata);
    out.freeze()
}

/// Fields of `connect` we act on
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectParams {
    pub app: String,
    pub tc_url: Option<String>,
    pub flash_ver: Option<String>,
    pub object_encoding: f64,
}

impl ConnectParams {
    pub fn from_amf(obj: &AmfValue) -> Self {
        Self {
            // Some encoders append a trailing slash or a query string to the app
            app: obj
                .get_str("app")
                .map(|a| a.split('?').next().unwrap_or("").trim_end_matches('/').to_string())
                .unwrap_or_default(),
            tc_url: obj.get_str("tcUrl").map(str::to_string),
            flash_ver: obj.get_str("flashVer").map(str::to_string),
            object_encoding: obj.get_number("objectEncoding").unwrap_or(0.0),
        }
    }
}

/// Arguments of `publish`
#[derive(Debug, Clone, PartialEq)]
pub struct PublishParams {
    pub stream_name: String,
    /// "live", "record" or "append"
    pub publish_type: String,
    pub stream_id: u32,
}

impl PublishParams {
    pub fn from_command(cmd: &Command) -> Self {
        Self {
            stream_name: cmd.first_string_argument().unwrap_or("").to_string(),
            publish_type: cmd
                .arguments
                .get(1)
                .and_then(|v| v.as_str())
                .unwrap_or("live")
                .to_string(),
            stream_id: cmd.stream_id,
        }
    }
}

/// Arguments of `play`
#[derive(Debug, Clone, PartialEq)]
pub struct PlayParams {
    pub stream_name: String,
    pub reset: bool,
    pub stream_id: u32,
}

impl PlayParams {
    pub fn from_command(cmd: &Command) -> Self {
        Self {
            stream_name: cmd.first_string_argument().unwrap_or("").to_string(),
            reset: cmd.arguments.get(3).and_then(|v| v.as_bool()).unwrap_or(true),
            stream_id: cmd.stream_id,
        }
    }
}

/// Typed RTMP message
#[derive(Debug, Clone, PartialEq)]
pub enum RtmpMessage {
    SetChunkSize(u32),
    Abort { csid: u32 },
    Acknowledgement { sequence: u32 },
    UserControl(UserControlEvent),
    WindowAckSize(u32),
    SetPeerBandwidth { size: u32, limit_type: u8 },
    Audio { timestamp: u32, data: Bytes },
    Video { timestamp: u32, data: Bytes },
    Command(Command),
    Data(DataMessage),
    Unknown { message_type: u8, payload: Bytes },
}

impl RtmpMessage {
    pub fn from_chunk(chunk: &RtmpChunk) -> Result<Self> {
        let mut payload = chunk.payload.clone();
        let message_type = chunk.message_type;

        let message = match message_type {
            MSG_SET_CHUNK_SIZE => RtmpMessage::SetChunkSize(read_u32(&mut payload, message_type)? & 0x7FFF_FFFF),
            MSG_ABORT => RtmpMessage::Abort {
                csid: read_u32(&mut payload, message_type)?,
            },
            MSG_ACKNOWLEDGEMENT => RtmpMessage::Acknowledgement {
                sequence: read_u32(&mut payload, message_type)?,
            },
            MSG_USER_CONTROL => RtmpMessage::UserControl(UserControlEvent::parse(payload)?),
            MSG_WINDOW_ACK_SIZE => {
                RtmpMessage::WindowAckSize(read_u32(&mut payload, message_type)?)
            }
            MSG_SET_PEER_BANDWIDTH => {
                let size = read_u32(&mut payload, message_type)?;
                let limit_type = if payload.has_remaining() {
                    payload.get_u8()
                } else {
                    BANDWIDTH_LIMIT_DYNAMIC
                };
                RtmpMessage::SetPeerBandwidth { size, limit_type }
            }
            MSG_AUDIO => RtmpMessage::Audio {
                timestamp: chunk.timestamp,
                data: payload,
            },
            MSG_VIDEO => RtmpMessage::Video {
                timestamp: chunk.timestamp,
                data: payload,
            },
            MSG_COMMAND_AMF0 => {
                RtmpMessage::Command(Command::parse(payload, message_type, chunk.stream_id, chunk.timestamp)?)
            }
            MSG_COMMAND_AMF3 => RtmpMessage::Command(Command::parse(
                strip_amf3_envelope(payload),
                message_type,
                chunk.stream_id,
                chunk.timestamp,
            )?),
            MSG_DATA_AMF0 => {
                RtmpMessage::Data(DataMessage::parse(
                    payload,
                    message_type,
                    chunk.stream_id,
                    chunk.timestamp,
                )?)
            }
            MSG_DATA_AMF3 => RtmpMessage::Data(DataMessage::parse(
                strip_amf3_envelope(payload),
                message_type,
                chunk.stream_id,
                chunk.timestamp,
            )?),
            _ => RtmpMessage::Unknown {
                message_type,
                payload,
            },
        };
        Ok(message)
    }

    /// Message type id and payload
    pub fn encode(&self) -> (u8, Bytes) {
        let mut out = BytesMut::with_capacity(64);
        let message_type = match self {
            RtmpMessage::SetChunkSize(size) => {
                out.put_u32(*size);
                MSG_SET_CHUNK_SIZE
            }
            RtmpMessage::Abort { csid } => {
                out.put_u32(*csid);
                MSG_ABORT
            }
            RtmpMessage::Acknowledgement { sequence } => {
                out.put_u32(*sequence);
                MSG_ACKNOWLEDGEMENT
            }
            RtmpMessage::UserControl(event) => {
                event.write(&mut out);
                MSG_USER_CONTROL
            }
            RtmpMessage::WindowAckSize(size) => {
                out.put_u32(*size);
                MSG_WINDOW_ACK_SIZE
            }
            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                out.put_u32(*size);
                out.put_u8(*limit_type);
                MSG_SET_PEER_BANDWIDTH
            }
            RtmpMessage::Audio { data, .. } => return (MSG_AUDIO, data.clone()),
            RtmpMessage::Video { data, .. } => return (MSG_VIDEO, data.clone()),
            RtmpMessage::Command(cmd) => {
                cmd.write(&mut out);
                MSG_COMMAND_AMF0
            }
            RtmpMessage::Data(data) => return (MSG_DATA_AMF0, data.payload.clone()),
            RtmpMessage::Unknown {
                message_type,
                payload,
            } => return (*message_type, payload.clone()),
        };
        (message_type, out.freeze())
    }

    /// Wrap into a chunk on the conventional chunk stream for its kind
    pub fn into_chunk(self, stream_id: u32) -> RtmpChunk {
        let (csid, timestamp, stream_id) = match &self {
            RtmpMessage::Audio { timestamp, .. } => (CSID_AUDIO, *timestamp, stream_id),
            RtmpMessage::Video { timestamp, .. } => (CSID_VIDEO, *timestamp, stream_id),
            RtmpMessage::Command(cmd) => (CSID_COMMAND, 0, cmd.stream_id),
            RtmpMessage::Data(data) => (CSID_DATA, data.timestamp, stream_id),
            RtmpMessage::Unknown { .. } => (CSID_COMMAND, 0, stream_id),
            _ => (CSID_PROTOCOL_CONTROL, 0, 0),
        };
        let (message_type, payload) = self.encode();
        RtmpChunk {
            csid,
            timestamp,
            message_type,
            stream_id,
            payload,
        }
    }
}

/// AMF3 command/data messages start with a format selector byte (0 = AMF0)
fn strip_amf3_envelope(mut payload: Bytes) -> Bytes {
    if payload.first() == Some(&0) {
        payload.advance(1);
    }
    payload
}

fn read_u32(payload: &mut Bytes, message_type: u8) -> Result<u32> {
    if payload.remaining() < 4 {
        return Err(malformed(message_type, "payload shorter than 4 bytes"));
    }
    Ok(payload.get_u32())
}

fn malformed(message_type: u8, reason: &'static str) -> crate::error::Error {
    ProtocolError::MalformedMessage {
        message_type,
        reason,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reparse(msg: RtmpMessage, stream_id: u32) -> RtmpMessage {
        let chunk = msg.into_chunk(stream_id);
        RtmpMessage::from_chunk(&chunk).unwrap()
    }

    #[test]
    fn test_control_messages() {
        for msg in [
            RtmpMessage::SetChunkSize(4096),
            RtmpMessage::Acknowledgement { sequence: 2_500_000 },
            RtmpMessage::WindowAckSize(2_500_000),
            RtmpMessage::SetPeerBandwidth {
                size: 2_500_000,
                limit_type: BANDWIDTH_LIMIT_DYNAMIC,
            },
            RtmpMessage::UserControl(UserControlEvent::StreamBegin(1)),
            RtmpMessage::UserControl(UserControlEvent::PingRequest(1234)),
            RtmpMessage::UserControl(UserControlEvent::SetBufferLength {
                stream_id: 1,
                buffer_ms: 3000,
            }),
        ] {
            assert_eq!(reparse(msg.clone(), 0), msg);
        }
    }

    #[test]
    fn test_on_status_shape() {
        let status = Command::on_status(1, "error", NS_PUBLISH_BAD_NAME, "already publishing");
        let chunk = RtmpMessage::Command(status).into_chunk(0);
        assert_eq!(chunk.csid, CSID_COMMAND);
        assert_eq!(chunk.stream_id, 1);

        let RtmpMessage::Command(cmd) = RtmpMessage::from_chunk(&chunk).unwrap() else {
            panic!("expected command");
        };
        assert_eq!(cmd.name, CMD_ON_STATUS);
        assert_eq!(cmd.command_object, AmfValue::Null);
        assert_eq!(cmd.status_code(), Some(NS_PUBLISH_BAD_NAME));
        assert_eq!(cmd.status_level(), Some("error"));
    }

    #[test]
    fn test_amf3_command_envelope() {
        let cmd = Command::new(
            CMD_CONNECT,
            1.0,
            AmfObject::new().with("app", "live").into(),
            vec![],
        );
        let (_, body) = RtmpMessage::Command(cmd.clone()).encode();
        let mut payload = BytesMut::new();
        payload.put_u8(0);
        payload.put_slice(&body);

        let chunk = RtmpChunk {
            csid: CSID_COMMAND,
            timestamp: 0,
            message_type: MSG_COMMAND_AMF3,
            stream_id: 0,
            payload: payload.freeze(),
        };
        assert_eq!(
            RtmpMessage::from_chunk(&chunk).unwrap(),
            RtmpMessage::Command(cmd)
        );
    }

    #[test]
    fn test_set_data_frame_metadata_is_unwrapped() {
        let meta = amf::encode_all(&[
            AmfValue::String(CMD_ON_METADATA.into()),
            AmfValue::EcmaArray(AmfObject::new().with("width", 1280.0)),
        ]);
        let wrapped = set_data_frame(&meta);

        let chunk = RtmpChunk {
            csid: CSID_DATA,
            timestamp: 0,
            message_type: MSG_DATA_AMF0,
            stream_id: 1,
            payload: wrapped,
        };
        let RtmpMessage::Data(data) = RtmpMessage::from_chunk(&chunk).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(data.name, CMD_SET_DATA_FRAME);
        assert_eq!(data.metadata(), Some(meta.clone()));

        let plain = RtmpChunk {
            payload: meta.clone(),
            ..chunk
        };
        let RtmpMessage::Data(data) = RtmpMessage::from_chunk(&plain).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(data.metadata(), Some(meta));
        assert_eq!(data.values().unwrap()[0].get_number("width"), Some(1280.0));
    }

    #[test]
    fn test_connect_params() {
        let obj: AmfValue = AmfObject::new()
            .with("app", "live/")
            .with("tcUrl", "rtmp://localhost:1935/live")
            .with("flashVer", "FMLE/3.0")
            .into();
        let params = ConnectParams::from_amf(&obj);
        assert_eq!(params.app, "live");
        assert_eq!(params.tc_url.as_deref(), Some("rtmp://localhost:1935/live"));
        assert_eq!(ConnectParams::from_amf(&AmfValue::Null).app, "");
    }

    #[test]
    fn test_publish_and_play_params() {
        let publish = Command::new(
            CMD_PUBLISH,
            5.0,
            AmfValue::Null,
            vec!["test".into(), "live".into()],
        )
        .on_stream(1);
        let p = PublishParams::from_command(&publish);
        assert_eq!(p.stream_name, "test");
        assert_eq!(p.publish_type, "live");
        assert_eq!(p.stream_id, 1);

        let play = Command::new(CMD_PLAY, 4.0, AmfValue::Null, vec!["test".into()]);
        assert!(PlayParams::from_command(&play).reset);
    }

    #[test]
    fn test_truncated_control_message() {
        let chunk = RtmpChunk {
            csid: CSID_PROTOCOL_CONTROL,
            timestamp: 0,
            message_type: MSG_WINDOW_ACK_SIZE,
            stream_id: 0,
            payload: Bytes::from_static(&[0, 1]),
        };
        assert!(RtmpMessage::from_chunk(&chunk).is_err());
    }

    #[test]
    fn test_media_passthrough() {
        let video = RtmpMessage::Video {
            timestamp: 40,
            data: Bytes::from_static(&[0x17, 0x01, 0, 0, 0]),
        };
        let chunk = video.clone().into_chunk(1);
        assert_eq!(chunk.csid, CSID_VIDEO);
        assert_eq!(chunk.timestamp, 40);
        assert_eq!(RtmpMessage::from_chunk(&chunk).unwrap(), video);
    }
}
