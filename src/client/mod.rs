//! RTMP client
//!
//! Just enough of the publishing side of the protocol to push a live
//! stream to a remote platform.

pub mod config;
pub mod connector;

pub use config::{ClientConfig, RtmpUrl};
pub use connector::RtmpConnector;
