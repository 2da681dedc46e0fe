//! RTMP wire protocol: handshake, chunk stream codec and message model

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;

pub use chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
pub use message::{Command, DataMessage, RtmpMessage, UserControlEvent};
