//! rtmp-fanout
//!
//! An RTMP ingest server that accepts one or more live streams from
//! encoders such as OBS or ffmpeg and pushes each of them to several
//! streaming platforms at once.
//!
//! ```text
//!  encoder ──RTMP──► RtmpServer ──► session::Connection ──ingest──► StreamRegistry
//!                                                                     │     │
//!                                              players ◄──subscribe───┘     │ StreamEvent
//!                                                                           ▼
//!                               platforms ◄──RTMP── RelaySession ◄── RelayEngine
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rtmp_fanout::registry::StreamRegistry;
//! use rtmp_fanout::relay::{RelayConfig, RelayEngine, RelayTarget};
//! use rtmp_fanout::server::{RtmpServer, ServerConfig};
//!
//! # async fn example() -> rtmp_fanout::error::Result<()> {
//! let registry = Arc::new(StreamRegistry::new());
//! let events = registry.events();
//!
//! let targets = vec![RelayTarget::known("twitch", "live_123").unwrap()];
//! let engine = Arc::new(RelayEngine::new(targets, Arc::clone(&registry), RelayConfig::default()));
//! tokio::spawn({
//!     let engine = Arc::clone(&engine);
//!     async move { engine.run(events).await }
//! });
//!
//! let server = RtmpServer::new(ServerConfig::default(), registry);
//! server.run().await
//! # }
//! ```

pub mod amf;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod stats;

pub use error::{Error, Result};
pub use registry::{StreamKey, StreamRegistry};
pub use relay::{RelayEngine, RelayTarget};
pub use server::{RtmpServer, ServerConfig};
