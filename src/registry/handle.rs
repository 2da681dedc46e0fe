//! RAII handles handed out by the registry
//!
//! Both handles release their registry state in `Drop`, so a session that
//! dies on a socket error or a cancelled task never leaves a stale publisher
//! or subscriber behind.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};

use crate::media::packet::MediaPacket;

use super::error::RegistryError;
use super::key::StreamKey;
use super::store::StreamRegistry;

/// Proof of being the publisher of a key
pub struct PublisherHandle {
    registry: Arc<StreamRegistry>,
    key: StreamKey,
    session_id: u64,
    released: bool,
}

impl PublisherHandle {
    pub(super) fn new(registry: Arc<StreamRegistry>, key: StreamKey, session_id: u64) -> Self {
        Self {
            registry,
            key,
            session_id,
            released: false,
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Stamp and fan out a packet; returns its sequence number
    pub fn ingest(&self, packet: MediaPacket) -> Result<u64, RegistryError> {
        self.registry.ingest(&self.key, self.session_id, packet)
    }

    /// Release the key now
    pub fn end(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.registry.end_publish(&self.key, self.session_id) {
            tracing::debug!(stream = %self.key, error = %e, "Publisher already released");
        }
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PublisherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherHandle")
            .field("key", &self.key)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Outcome of waiting on a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Packet(MediaPacket),
    /// The publish cycle ended; call `resubscribe` to wait for the next one
    Ended,
    /// The consumer fell behind too often and should disconnect
    TooSlow,
}

/// A consumer attached to one stream key
///
/// Lagging consumers lose the oldest queued packets; delivery then resumes
/// at the next video keyframe so decoders never see a broken GOP.
pub struct Subscription {
    registry: Arc<StreamRegistry>,
    key: StreamKey,
    id: u64,
    session_id: u64,
    rx: broadcast::Receiver<MediaPacket>,
    catchup: Vec<MediaPacket>,
    max_lag_events: u32,
    lag_events: u32,
    skipping: bool,
    seen_video: bool,
}

impl Subscription {
    pub(super) fn new(
        registry: Arc<StreamRegistry>,
        key: StreamKey,
        id: u64,
        session_id: u64,
        rx: broadcast::Receiver<MediaPacket>,
        catchup: Vec<MediaPacket>,
    ) -> Self {
        let max_lag_events = registry.config().max_consecutive_lag_events;
        let seen_video = catchup.iter().any(|p| p.is_video());
        Self {
            registry,
            key,
            id,
            session_id,
            rx,
            catchup,
            max_lag_events,
            lag_events: 0,
            skipping: false,
            seen_video,
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cached packets to send before anything from `recv`
    pub fn take_catchup(&mut self) -> Vec<MediaPacket> {
        std::mem::take(&mut self.catchup)
    }

    /// Attach to the current (or next) publish cycle after `Delivery::Ended`
    pub fn resubscribe(&mut self) {
        let (rx, catchup) = self.registry.attach(&self.key, self.id, self.session_id);
        self.seen_video = catchup.iter().any(|p| p.is_video());
        self.rx = rx;
        self.catchup = catchup;
        self.lag_events = 0;
        self.skipping = false;
    }

    pub async fn recv(&mut self) -> Delivery {
        loop {
            match self.rx.recv().await {
                Ok(packet) => {
                    if let Some(packet) = self.filter(packet) {
                        return Delivery::Packet(packet);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    self.lag_events += 1;
                    tracing::warn!(
                        stream = %self.key,
                        session_id = self.session_id,
                        skipped,
                        lag_events = self.lag_events,
                        "Slow consumer dropped packets"
                    );
                    if self.lag_events >= self.max_lag_events {
                        return Delivery::TooSlow;
                    }
                    self.skipping = self.seen_video;
                }
                Err(RecvError::Closed) => return Delivery::Ended,
            }
        }
    }

    fn filter(&mut self, packet: MediaPacket) -> Option<MediaPacket> {
        if packet.is_video() {
            self.seen_video = true;
        }
        if !self.skipping || packet.header || (!packet.is_video() && !packet.is_audio()) {
            return Some(packet);
        }
        if packet.is_video() && packet.keyframe {
            self.skipping = false;
            self.lag_events = 0;
            return Some(packet);
        }
        None
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.key, self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::registry::RegistryConfig;

    fn key() -> StreamKey {
        StreamKey::try_new("live", "lag").unwrap()
    }

    fn video(ts: u32, keyframe: bool) -> MediaPacket {
        let first = if keyframe { 0x17 } else { 0x27 };
        MediaPacket::video(ts, Bytes::from(vec![first, 0x01, 0, 0, 0]))
    }

    #[tokio::test]
    async fn test_lagging_consumer_skips_to_keyframe() {
        let config = RegistryConfig::default().broadcast_capacity(4);
        let registry = Arc::new(StreamRegistry::with_config(config));
        let publisher = registry.begin_publish(&key(), 1).unwrap();
        let mut sub = registry.subscribe(&key(), 2);

        publisher.ingest(video(0, true)).unwrap();
        assert!(matches!(sub.recv().await, Delivery::Packet(_)));

        // Overflow the queue: the consumer loses the oldest packets
        for ts in 1..=6 {
            publisher.ingest(video(ts, false)).unwrap();
        }
        publisher.ingest(video(7, true)).unwrap();
        publisher.ingest(video(8, false)).unwrap();

        match sub.recv().await {
            Delivery::Packet(p) => {
                assert_eq!(p.timestamp, 7);
                assert!(p.keyframe);
            }
            other => panic!("unexpected {:?}", other),
        }
        match sub.recv().await {
            Delivery::Packet(p) => assert_eq!(p.timestamp, 8),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_repeated_lag_disconnects() {
        let config = RegistryConfig::default()
            .broadcast_capacity(2)
            .max_consecutive_lag_events(2);
        let registry = Arc::new(StreamRegistry::with_config(config));
        let publisher = registry.begin_publish(&key(), 1).unwrap();
        let mut sub = registry.subscribe(&key(), 2);

        publisher.ingest(video(0, true)).unwrap();
        assert!(matches!(sub.recv().await, Delivery::Packet(_)));

        for ts in 1..=4 {
            publisher.ingest(video(ts, false)).unwrap();
        }
        // First lag: only inter frames remain, so they are all skipped
        let idle = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(idle.is_err());

        // Lagging again before a keyframe arrives is too much
        for ts in 5..=8 {
            publisher.ingest(video(ts, false)).unwrap();
        }
        assert_eq!(sub.recv().await, Delivery::TooSlow);
    }

    #[tokio::test]
    async fn test_audio_only_stream_is_not_skipped() {
        let config = RegistryConfig::default().broadcast_capacity(2);
        let registry = Arc::new(StreamRegistry::with_config(config));
        let publisher = registry.begin_publish(&key(), 1).unwrap();
        let mut sub = registry.subscribe(&key(), 2);

        for ts in 0..5 {
            publisher
                .ingest(MediaPacket::audio(ts, Bytes::from_static(&[0xAF, 0x01, 0x00])))
                .unwrap();
        }
        match sub.recv().await {
            Delivery::Packet(p) => assert_eq!(p.timestamp, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_handle_end_releases_once() {
        let registry = Arc::new(StreamRegistry::new());
        let mut events = registry.events();
        let handle = registry.begin_publish(&key(), 1).unwrap();
        assert_eq!(handle.session_id(), 1);
        handle.end();

        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());
    }
}
