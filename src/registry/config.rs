//! Registry configuration

use crate::media::gop::DEFAULT_MAX_GOP_BYTES;

/// Registry tuning
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Per-consumer queue depth (packets). A consumer further behind than
    /// this loses the oldest packets.
    pub broadcast_capacity: usize,

    /// Keep the current GOP for late joiners
    pub gop_cache: bool,

    /// Maximum cached GOP size in bytes
    pub max_gop_bytes: usize,

    /// Lag events in a row before a consumer is disconnected
    pub max_consecutive_lag_events: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
            gop_cache: true,
            max_gop_bytes: DEFAULT_MAX_GOP_BYTES,
            max_consecutive_lag_events: 3,
        }
    }
}

impl RegistryConfig {
    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity.max(1);
        self
    }

    pub fn gop_cache(mut self, enabled: bool) -> Self {
        self.gop_cache = enabled;
        self
    }

    pub fn max_gop_bytes(mut self, bytes: usize) -> Self {
        self.max_gop_bytes = bytes;
        self
    }

    pub fn max_consecutive_lag_events(mut self, events: u32) -> Self {
        self.max_consecutive_lag_events = events.max(1);
        self
    }
}
