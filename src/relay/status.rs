//! Shared view of every relay session's state

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::Serialize;

use crate::registry::StreamKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Connecting,
    Relaying,
    Retrying,
    /// Gave up until the next publish of the stream
    Failed,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Connecting => "connecting",
            RelayState::Relaying => "relaying",
            RelayState::Retrying => "retrying",
            RelayState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub platform: String,
    pub stream: String,
    pub state: RelayState,
    /// Consecutive failed attempts
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Relay status per (stream, platform)
///
/// Written by relay sessions, read by the stats endpoint. The lock is never
/// held across an await.
#[derive(Debug, Default)]
pub struct RelayStatusBoard {
    entries: RwLock<BTreeMap<(StreamKey, String), RelayStatus>>,
}

impl RelayStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, key: &StreamKey, platform: &str, state: RelayState, attempts: u32) {
        let mut entries = self.entries.write();
        let entry = entries
            .entry((key.clone(), platform.to_string()))
            .or_insert_with(|| RelayStatus {
                platform: platform.to_string(),
                stream: key.to_string(),
                state,
                attempts,
                last_error: None,
            });
        entry.state = state;
        entry.attempts = attempts;
        if state == RelayState::Relaying {
            entry.last_error = None;
        }
    }

    pub fn record_error(&self, key: &StreamKey, platform: &str, error: &str) {
        if let Some(entry) = self
            .entries
            .write()
            .get_mut(&(key.clone(), platform.to_string()))
        {
            entry.last_error = Some(error.to_string());
        }
    }

    pub fn get(&self, key: &StreamKey, platform: &str) -> Option<RelayStatus> {
        self.entries
            .read()
            .get(&(key.clone(), platform.to_string()))
            .cloned()
    }

    pub fn remove(&self, key: &StreamKey, platform: &str) {
        self.entries.write().remove(&(key.clone(), platform.to_string()));
    }

    /// Drop every entry of a stream
    pub fn remove_stream(&self, key: &StreamKey) {
        self.entries.write().retain(|(k, _), _| k != key);
    }

    /// All entries, ordered by stream then platform
    pub fn snapshot(&self) -> Vec<RelayStatus> {
        self.entries.read().values().cloned().collect()
    }

    pub fn count(&self, state: RelayState) -> usize {
        self.entries
            .read()
            .values()
            .filter(|s| s.state == state)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> StreamKey {
        StreamKey::try_new("live", name).unwrap()
    }

    #[test]
    fn test_state_transitions() {
        let board = RelayStatusBoard::new();
        board.set_state(&key("a"), "youtube", RelayState::Connecting, 0);
        board.set_state(&key("a"), "youtube", RelayState::Retrying, 1);
        board.record_error(&key("a"), "youtube", "could not reach target");

        let status = board.get(&key("a"), "youtube").unwrap();
        assert_eq!(status.state, RelayState::Retrying);
        assert_eq!(status.attempts, 1);
        assert_eq!(status.stream, "live/a");
        assert_eq!(status.last_error.as_deref(), Some("could not reach target"));
        assert_eq!(board.count(RelayState::Retrying), 1);
    }

    #[test]
    fn test_recovery_clears_last_error() {
        let board = RelayStatusBoard::new();
        board.set_state(&key("a"), "twitch", RelayState::Retrying, 2);
        board.record_error(&key("a"), "twitch", "connection reset");
        board.set_state(&key("a"), "twitch", RelayState::Connecting, 2);
        assert!(board.get(&key("a"), "twitch").unwrap().last_error.is_some());

        board.set_state(&key("a"), "twitch", RelayState::Relaying, 0);
        let status = board.get(&key("a"), "twitch").unwrap();
        assert_eq!(status.attempts, 0);
        assert_eq!(status.last_error, None);
    }

    #[test]
    fn test_remove_stream_only_touches_that_stream() {
        let board = RelayStatusBoard::new();
        board.set_state(&key("b"), "twitch", RelayState::Relaying, 0);
        board.set_state(&key("a"), "youtube", RelayState::Relaying, 0);
        board.set_state(&key("a"), "facebook", RelayState::Failed, 3);

        let platforms: Vec<_> = board.snapshot().into_iter().map(|s| s.platform).collect();
        assert_eq!(platforms, ["facebook", "youtube", "twitch"]);

        board.remove_stream(&key("a"));
        assert_eq!(board.len(), 1);
        assert!(board.get(&key("b"), "twitch").is_some());

        board.remove(&key("b"), "twitch");
        assert!(board.is_empty());
    }

    #[test]
    fn test_serializes_camel_case() {
        let board = RelayStatusBoard::new();
        board.set_state(&key("a"), "youtube", RelayState::Failed, 10);
        let json = serde_json::to_value(board.snapshot()).unwrap();
        assert_eq!(json[0]["state"], "failed");
        assert_eq!(json[0]["attempts"], 10);
        assert!(json[0]["lastError"].is_null());
    }
}
