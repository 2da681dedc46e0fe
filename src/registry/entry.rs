//! Per-stream registry state

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::media::gop::GopCache;
use crate::media::packet::MediaPacket;

use super::config::RegistryConfig;

/// State of one stream key
///
/// `tx` always belongs to the current or the upcoming publish cycle: it is
/// replaced when a publisher ends, which closes every receiver of the
/// finished cycle. Subscribers that attach while nobody publishes receive
/// the next cycle's packets on the pending channel.
pub(super) struct StreamEntry {
    pub publisher: Option<u64>,
    pub tx: broadcast::Sender<MediaPacket>,
    pub gop: GopCache,
    /// subscription id -> session id
    pub subscribers: HashMap<u64, u64>,
    pub published_at: Option<Instant>,
    pub packets: u64,
    pub bytes: u64,
    capacity: usize,
}

impl StreamEntry {
    pub fn new(config: &RegistryConfig) -> Self {
        let (tx, _) = broadcast::channel(config.broadcast_capacity);
        let gop = GopCache::with_max_bytes(config.max_gop_bytes);
        Self {
            publisher: None,
            tx,
            gop: if config.gop_cache { gop } else { gop.headers_only() },
            subscribers: HashMap::new(),
            published_at: None,
            packets: 0,
            bytes: 0,
            capacity: config.broadcast_capacity,
        }
    }

    pub fn start_cycle(&mut self, session_id: u64) {
        self.publisher = Some(session_id);
        self.published_at = Some(Instant::now());
        self.packets = 0;
        self.bytes = 0;
    }

    /// Close the cycle's channel and forget cached media
    pub fn end_cycle(&mut self) {
        self.publisher = None;
        self.published_at = None;
        self.gop.clear();
        let (tx, _) = broadcast::channel(self.capacity);
        self.tx = tx;
    }

    pub fn record(&mut self, packet: &MediaPacket) {
        self.packets += 1;
        self.bytes += packet.size() as u64;
        self.gop.push(packet);
    }

    pub fn is_unused(&self) -> bool {
        self.publisher.is_none() && self.subscribers.is_empty()
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            publisher: self.publisher,
            subscriber_count: self.subscribers.len(),
            gop_frames: self.gop.frame_count(),
            gop_bytes: self.gop.size(),
            packets: self.packets,
            bytes: self.bytes,
            uptime: self.published_at.map(|at| at.elapsed()),
        }
    }
}

/// Snapshot of one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    /// Session id of the publisher, if any
    pub publisher: Option<u64>,
    pub subscriber_count: usize,
    pub gop_frames: usize,
    pub gop_bytes: usize,
    /// Packets ingested during the current publish cycle
    pub packets: u64,
    pub bytes: u64,
    /// Time since the publisher started
    pub uptime: Option<Duration>,
}

impl StreamStats {
    pub fn has_publisher(&self) -> bool {
        self.publisher.is_some()
    }
}
