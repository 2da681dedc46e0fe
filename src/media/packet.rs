//! Media packets routed through the registry
//!
//! Every RTMP audio/video message body is an FLV tag body:
//!
//! ```text
//! video: | FrameType (4) | CodecID (4) | AVCPacketType (8) | ...
//! audio: | SoundFormat (4) | Rate (2) | Size (1) | Type (1) | AACPacketType (8) | ...
//! ```
//!
//! Enhanced RTMP sets the top bit of the first video byte (`IsExHeader`), in
//! which case the low nibble is a packet type instead of a codec id. Only the
//! bits needed for caching decisions are inspected; payloads are forwarded
//! untouched.

use bytes::Bytes;

use crate::protocol::constants::{CMD_SET_DATA_FRAME, MSG_AUDIO, MSG_DATA_AMF0, MSG_VIDEO};
use crate::protocol::message::{set_data_frame, DataMessage, RtmpMessage};

const VIDEO_FRAME_KEY: u8 = 1;
const VIDEO_FRAME_GENERATED_KEY: u8 = 4;
const VIDEO_CODEC_AVC: u8 = 7;
const VIDEO_CODEC_HEVC: u8 = 12;
const VIDEO_CODEC_AV1: u8 = 13;
const VIDEO_EX_HEADER: u8 = 0x80;
const EX_PACKET_SEQUENCE_START: u8 = 0;

const AUDIO_FORMAT_AAC: u8 = 10;
const AUDIO_FORMAT_EX_HEADER: u8 = 9;

/// What a packet carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Audio,
    Video,
    /// `onMetaData` (AMF0, without the `@setDataFrame` wrapper)
    Metadata,
}

/// One audio, video or metadata message of a live stream
///
/// Cheap to clone: `data` is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    pub kind: PacketKind,
    /// Timestamp in milliseconds, as sent by the publisher
    pub timestamp: u32,
    pub data: Bytes,
    pub keyframe: bool,
    /// Decoder configuration (AVC/HEVC/AV1 config record, AudioSpecificConfig)
    pub header: bool,
    /// Stamped by the registry; strictly increasing per stream key
    pub sequence: u64,
}

impl MediaPacket {
    pub fn video(timestamp: u32, data: Bytes) -> Self {
        let (keyframe, header) = classify_video(&data);
        Self {
            kind: PacketKind::Video,
            timestamp,
            data,
            keyframe,
            header,
            sequence: 0,
        }
    }

    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        let header = is_audio_sequence_header(&data);
        Self {
            kind: PacketKind::Audio,
            timestamp,
            data,
            keyframe: false,
            header,
            sequence: 0,
        }
    }

    pub fn metadata(timestamp: u32, data: Bytes) -> Self {
        Self {
            kind: PacketKind::Metadata,
            timestamp,
            data,
            keyframe: false,
            header: false,
            sequence: 0,
        }
    }

    /// Convert an inbound message; `None` for anything that is not media
    pub fn from_message(message: &RtmpMessage) -> Option<Self> {
        match message {
            RtmpMessage::Audio { timestamp, data } => Some(Self::audio(*timestamp, data.clone())),
            RtmpMessage::Video { timestamp, data } => Some(Self::video(*timestamp, data.clone())),
            RtmpMessage::Data(data) => data
                .metadata()
                .map(|meta| Self::metadata(data.timestamp, meta)),
            _ => None,
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind == PacketKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind == PacketKind::Audio
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// RTMP message type this packet travels as
    pub fn message_type(&self) -> u8 {
        match self.kind {
            PacketKind::Audio => MSG_AUDIO,
            PacketKind::Video => MSG_VIDEO,
            PacketKind::Metadata => MSG_DATA_AMF0,
        }
    }

    /// Outbound message for a player or a relay target
    ///
    /// Publishing peers (relay targets) expect metadata wrapped in
    /// `@setDataFrame`; players expect the bare `onMetaData`.
    pub fn to_message(&self, stream_id: u32, wrap_metadata: bool) -> RtmpMessage {
        match self.kind {
            PacketKind::Audio => RtmpMessage::Audio {
                timestamp: self.timestamp,
                data: self.data.clone(),
            },
            PacketKind::Video => RtmpMessage::Video {
                timestamp: self.timestamp,
                data: self.data.clone(),
            },
            PacketKind::Metadata if wrap_metadata => RtmpMessage::Data(DataMessage {
                name: CMD_SET_DATA_FRAME.to_string(),
                stream_id,
                timestamp: self.timestamp,
                body: self.data.clone(),
                payload: set_data_frame(&self.data),
            }),
            PacketKind::Metadata => RtmpMessage::Data(DataMessage {
                name: crate::protocol::constants::CMD_ON_METADATA.to_string(),
                stream_id,
                timestamp: self.timestamp,
                body: self.data.clone(),
                payload: self.data.clone(),
            }),
        }
    }
}

/// (keyframe, sequence header)
fn classify_video(data: &[u8]) -> (bool, bool) {
    let Some(&first) = data.first() else {
        return (false, false);
    };

    if first & VIDEO_EX_HEADER != 0 {
        let frame_type = (first >> 4) & 0x07;
        let packet_type = first & 0x0F;
        let keyframe = frame_type == VIDEO_FRAME_KEY;
        return (keyframe, packet_type == EX_PACKET_SEQUENCE_START);
    }

    let frame_type = first >> 4;
    let codec = first & 0x0F;
    let keyframe = frame_type == VIDEO_FRAME_KEY || frame_type == VIDEO_FRAME_GENERATED_KEY;
    let header = matches!(codec, VIDEO_CODEC_AVC | VIDEO_CODEC_HEVC | VIDEO_CODEC_AV1)
        && data.get(1) == Some(&0);
    (keyframe, header)
}

fn is_audio_sequence_header(data: &[u8]) -> bool {
    let Some(&first) = data.first() else {
        return false;
    };
    match first >> 4 {
        AUDIO_FORMAT_AAC => data.get(1) == Some(&0),
        AUDIO_FORMAT_EX_HEADER => first & 0x0F == EX_PACKET_SEQUENCE_START,
        _ => false,
    }
}
