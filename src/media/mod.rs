//! Media handling
//!
//! - packet classification (keyframes, sequence headers, metadata)
//! - GOP caching for late joiners

pub mod gop;
pub mod packet;

pub use gop::GopCache;
pub use packet::{MediaPacket, PacketKind};
