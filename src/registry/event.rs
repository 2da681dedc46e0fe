//! Lifecycle notifications emitted by the registry

use super::key::StreamKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A publisher claimed the key
    Started(StreamKey),
    /// The publisher released the key (normal unpublish or disconnect)
    Ended(StreamKey),
}

impl StreamEvent {
    pub fn key(&self) -> &StreamKey {
        match self {
            StreamEvent::Started(key) | StreamEvent::Ended(key) => key,
        }
    }
}
