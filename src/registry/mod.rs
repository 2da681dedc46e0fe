//! Publish registry
//!
//! Maps stream keys to at most one publisher and any number of subscribers,
//! and fans media out through one `tokio::sync::broadcast` channel per
//! publish cycle.
//!
//! ```text
//!                        Arc<StreamRegistry>
//!                  ┌────────────────────────────┐
//!                  │ Mutex<HashMap<StreamKey,   │
//!  PublisherHandle │   StreamEntry {            │  Subscription
//!  ── ingest() ──► │     publisher, gop, tx ────┼──► recv()  (player)
//!                  │   }>                       │──► recv()  (relay)
//!                  └─────────────┬──────────────┘
//!                                │ StreamEvent::{Started, Ended}
//!                                ▼
//!                          RelayEngine
//! ```
//!
//! `bytes::Bytes` is reference counted, so every consumer shares the
//! publisher's payload allocation.

pub mod config;
mod entry;
pub mod error;
pub mod event;
pub mod handle;
pub mod key;
mod store;

pub use config::RegistryConfig;
pub use entry::StreamStats;
pub use error::RegistryError;
pub use event::StreamEvent;
pub use handle::{Delivery, PublisherHandle, Subscription};
pub use key::StreamKey;
pub use store::StreamRegistry;
