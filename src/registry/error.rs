//! Registry error types

use thiserror::Error;

use super::key::StreamKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Another session already publishes this key
    #[error("stream already has a publisher: {0}")]
    AlreadyPublishing(StreamKey),

    /// The caller is not the current publisher of the key
    #[error("session {session_id} is not the publisher of {key}")]
    PublisherMismatch { key: StreamKey, session_id: u64 },

    #[error("invalid stream key: {0:?}")]
    InvalidKey(String),
}
