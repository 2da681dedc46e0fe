//! Stream registry implementation
//!
//! One `parking_lot::Mutex` guards the key map, the sequence counter and the
//! event listeners. Critical sections never await or touch sockets, so the
//! lock is safe to take from both async tasks and `Drop`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::media::packet::MediaPacket;

use super::config::RegistryConfig;
use super::entry::{StreamEntry, StreamStats};
use super::error::RegistryError;
use super::event::StreamEvent;
use super::handle::{PublisherHandle, Subscription};
use super::key::StreamKey;

struct Inner {
    streams: HashMap<StreamKey, StreamEntry>,
    /// Shared by all keys, so sequence numbers never repeat for a key even
    /// after its entry was removed and recreated
    next_sequence: u64,
    listeners: Vec<mpsc::UnboundedSender<StreamEvent>>,
}

impl Inner {
    fn emit(&mut self, event: StreamEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Process-wide map of stream keys to publishers and subscribers
pub struct StreamRegistry {
    inner: Mutex<Inner>,
    next_subscription_id: AtomicU64,
    config: RegistryConfig,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                next_sequence: 1,
                listeners: Vec::new(),
            }),
            next_subscription_id: AtomicU64::new(1),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Listen for `Started`/`Ended` events
    ///
    /// Every receiver gets every event emitted after it was created.
    pub fn events(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().listeners.push(tx);
        rx
    }

    /// Claim `key` for `session_id`
    ///
    /// Fails with `AlreadyPublishing` if another session holds the key. The
    /// returned handle releases the key when dropped.
    pub fn begin_publish(
        self: &Arc<Self>,
        key: &StreamKey,
        session_id: u64,
    ) -> Result<PublisherHandle, RegistryError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .streams
            .entry(key.clone())
            .or_insert_with(|| StreamEntry::new(&self.config));

        if let Some(current) = entry.publisher {
            tracing::warn!(
                stream = %key,
                session_id,
                publisher = current,
                "Publish rejected, key already in use"
            );
            return Err(RegistryError::AlreadyPublishing(key.clone()));
        }

        entry.start_cycle(session_id);
        tracing::info!(
            stream = %key,
            session_id,
            waiting_subscribers = entry.subscribers.len(),
            "Publishing started"
        );
        inner.emit(StreamEvent::Started(key.clone()));

        Ok(PublisherHandle::new(Arc::clone(self), key.clone(), session_id))
    }

    /// Fan a packet out to every subscriber of `key`
    ///
    /// Stamps and returns the packet's sequence number. Never blocks: slow
    /// consumers lose their oldest packets instead.
    pub fn ingest(
        &self,
        key: &StreamKey,
        session_id: u64,
        mut packet: MediaPacket,
    ) -> Result<u64, RegistryError> {
        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence;

        let entry = match inner.streams.get_mut(key) {
            Some(entry) if entry.publisher == Some(session_id) => entry,
            _ => {
                return Err(RegistryError::PublisherMismatch {
                    key: key.clone(),
                    session_id,
                })
            }
        };

        packet.sequence = sequence;
        entry.record(&packet);
        // No receivers is not an error
        let receivers = entry.tx.send(packet).unwrap_or(0);
        inner.next_sequence += 1;

        tracing::trace!(stream = %key, sequence, receivers, "Packet ingested");
        Ok(sequence)
    }

    /// Release `key`
    ///
    /// Closes the cycle's channel (subscribers observe the end of stream),
    /// clears cached media and emits `Ended`. The entry is removed if nobody
    /// is waiting on it.
    pub fn end_publish(&self, key: &StreamKey, session_id: u64) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();

        let entry = match inner.streams.get_mut(key) {
            Some(entry) if entry.publisher == Some(session_id) => entry,
            _ => {
                return Err(RegistryError::PublisherMismatch {
                    key: key.clone(),
                    session_id,
                })
            }
        };

        let packets = entry.packets;
        entry.end_cycle();
        let remove = entry.is_unused();
        if remove {
            inner.streams.remove(key);
        }

        tracing::info!(stream = %key, session_id, packets, "Publishing ended");
        inner.emit(StreamEvent::Ended(key.clone()));
        Ok(())
    }

    /// Attach to `key`, creating a waiting entry if nobody publishes yet
    ///
    /// The catchup packets and the live receiver are taken under the same
    /// lock, so nothing is lost or duplicated between them.
    pub fn subscribe(self: &Arc<Self>, key: &StreamKey, session_id: u64) -> Subscription {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (rx, catchup) = self.attach(key, id, session_id);
        tracing::debug!(
            stream = %key,
            session_id,
            subscription = id,
            catchup = catchup.len(),
            "Subscriber added"
        );
        Subscription::new(Arc::clone(self), key.clone(), id, session_id, rx, catchup)
    }

    pub(super) fn attach(
        &self,
        key: &StreamKey,
        subscription_id: u64,
        session_id: u64,
    ) -> (tokio::sync::broadcast::Receiver<MediaPacket>, Vec<MediaPacket>) {
        let mut inner = self.inner.lock();
        let entry = inner
            .streams
            .entry(key.clone())
            .or_insert_with(|| StreamEntry::new(&self.config));
        entry.subscribers.insert(subscription_id, session_id);
        (entry.tx.subscribe(), entry.gop.catchup())
    }

    pub(super) fn unsubscribe(&self, key: &StreamKey, subscription_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.streams.get_mut(key) {
            entry.subscribers.remove(&subscription_id);
            if entry.is_unused() {
                inner.streams.remove(key);
            }
            tracing::debug!(stream = %key, subscription = subscription_id, "Subscriber removed");
        }
    }

    pub fn is_publishing(&self, key: &StreamKey) -> bool {
        self.inner
            .lock()
            .streams
            .get(key)
            .is_some_and(|entry| entry.publisher.is_some())
    }

    /// Number of keys with an active publisher
    pub fn active_stream_count(&self) -> usize {
        self.inner
            .lock()
            .streams
            .values()
            .filter(|entry| entry.publisher.is_some())
            .count()
    }

    /// Keys with an active publisher, sorted
    pub fn active_streams(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self
            .inner
            .lock()
            .streams
            .iter()
            .filter(|(_, entry)| entry.publisher.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn stream_stats(&self, key: &StreamKey) -> Option<StreamStats> {
        self.inner.lock().streams.get(key).map(StreamEntry::stats)
    }

    /// Number of entries, including ones with only waiting subscribers
    pub fn stream_count(&self) -> usize {
        self.inner.lock().streams.len()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
