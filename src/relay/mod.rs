//! Relay engine
//!
//! For every stream that starts publishing, one [`RelaySession`] per
//! enabled [`RelayTarget`] connects to the platform as an RTMP client and
//! forwards the stream in ingest order. Sessions retry with exponential
//! backoff and are cancelled as soon as the stream ends.

pub mod config;
pub mod engine;
pub mod session;
pub mod status;
pub mod target;

pub use config::RelayConfig;
pub use engine::RelayEngine;
pub use session::{RelayExit, RelaySession};
pub use status::{RelayState, RelayStatus, RelayStatusBoard};
pub use target::{RelayTarget, PLATFORMS};
