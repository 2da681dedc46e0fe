//! Server statistics

pub mod aggregator;
pub mod metrics;

pub use aggregator::{StatsAggregator, StatsSnapshot};
pub use metrics::{ConnectionGuard, ConnectionStats, ServerStats};
