//! Point-in-time view of the whole server for `/api/stats`

use std::sync::Arc;

use serde::Serialize;

use crate::registry::StreamRegistry;
use crate::relay::{RelayStatus, RelayStatusBoard, RelayTarget};

use super::metrics::{ConnectionStats, ServerStats};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Stream keys with a live publisher
    pub active_streams: usize,
    /// Platforms with a stream key configured
    pub connected_platforms: usize,
    pub active_platforms_list: Vec<String>,
    pub relays: Vec<RelayStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<ConnectionStats>,
}

/// Read-only combination of registry, relay board and listener counters
#[derive(Clone)]
pub struct StatsAggregator {
    registry: Arc<StreamRegistry>,
    board: Arc<RelayStatusBoard>,
    platforms: Vec<String>,
    server: Option<Arc<ServerStats>>,
}

impl StatsAggregator {
    pub fn new(
        registry: Arc<StreamRegistry>,
        board: Arc<RelayStatusBoard>,
        targets: &[RelayTarget],
    ) -> Self {
        let platforms = targets
            .iter()
            .filter(|t| t.is_enabled())
            .map(|t| t.platform.clone())
            .collect();
        Self {
            registry,
            board,
            platforms,
            server: None,
        }
    }

    pub fn with_server_stats(mut self, stats: Arc<ServerStats>) -> Self {
        self.server = Some(stats);
        self
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_streams: self.registry.active_stream_count(),
            connected_platforms: self.platforms.len(),
            active_platforms_list: self.platforms.clone(),
            relays: self.board.snapshot(),
            connections: self.server.as_ref().map(|s| s.snapshot()),
        }
    }
}
