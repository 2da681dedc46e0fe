//! Starts and stops relay sessions as streams come and go

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::{StreamEvent, StreamKey, StreamRegistry};

use super::config::RelayConfig;
use super::session::{RelayExit, RelaySession};
use super::status::RelayStatusBoard;
use super::target::RelayTarget;

/// Relay sessions carry ids far above the listener's so log lines and
/// registry subscribers stay distinguishable
const RELAY_SESSION_ID_BASE: u64 = 1 << 48;

struct RunningRelay {
    platform: String,
    cancel: CancellationToken,
    task: JoinHandle<RelayExit>,
}

/// Fans every published stream out to the enabled targets
pub struct RelayEngine {
    targets: Vec<RelayTarget>,
    registry: Arc<StreamRegistry>,
    config: RelayConfig,
    board: Arc<RelayStatusBoard>,
    running: Mutex<HashMap<StreamKey, Vec<RunningRelay>>>,
    next_session_id: AtomicU64,
}

impl RelayEngine {
    /// Disabled targets (no stream key) are dropped here
    pub fn new(targets: Vec<RelayTarget>, registry: Arc<StreamRegistry>, config: RelayConfig) -> Self {
        let targets = targets.into_iter().filter(RelayTarget::is_enabled).collect();
        Self {
            targets,
            registry,
            config,
            board: Arc::new(RelayStatusBoard::new()),
            running: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(RELAY_SESSION_ID_BASE),
        }
    }

    pub fn targets(&self) -> &[RelayTarget] {
        &self.targets
    }

    pub fn status_board(&self) -> &Arc<RelayStatusBoard> {
        &self.board
    }

    /// Consume registry events until the channel closes, then stop
    /// everything still running
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<StreamEvent>) {
        tracing::info!(targets = self.targets.len(), "Relay engine started");
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Started(key) => {
                    self.start_stream(&key).await;
                }
                StreamEvent::Ended(key) => self.stop_stream(&key).await,
            }
        }
        self.shutdown().await;
        tracing::info!("Relay engine stopped");
    }

    /// Spawn one session per target for `key`, returns how many
    pub async fn start_stream(&self, key: &StreamKey) -> usize {
        if self.targets.is_empty() {
            return 0;
        }
        // A stale set for the same key is torn down first
        self.stop_stream(key).await;

        let relays: Vec<RunningRelay> = self
            .targets
            .iter()
            .map(|target| {
                let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                let session = RelaySession::new(
                    id,
                    key.clone(),
                    target.clone(),
                    Arc::clone(&self.registry),
                    self.config.clone(),
                    Arc::clone(&self.board),
                    cancel.clone(),
                );
                tracing::debug!(session_id = id, stream = %key, platform = %target.platform, "Spawning relay");
                RunningRelay {
                    platform: target.platform.clone(),
                    cancel,
                    task: tokio::spawn(session.run()),
                }
            })
            .collect();

        let count = relays.len();
        self.running.lock().insert(key.clone(), relays);
        tracing::info!(stream = %key, relays = count, "Relays started");
        count
    }

    /// Cancel every session of `key`, wait for them and clear their status
    pub async fn stop_stream(&self, key: &StreamKey) {
        let relays = self.running.lock().remove(key);
        let Some(relays) = relays else {
            return;
        };

        for relay in &relays {
            relay.cancel.cancel();
        }
        for relay in relays {
            match relay.task.await {
                Ok(exit) => {
                    tracing::debug!(stream = %key, platform = %relay.platform, exit = ?exit, "Relay stopped")
                }
                Err(e) => {
                    tracing::warn!(stream = %key, platform = %relay.platform, error = %e, "Relay task panicked")
                }
            }
        }
        self.board.remove_stream(key);
        tracing::info!(stream = %key, "Relays stopped");
    }

    pub async fn shutdown(&self) {
        let keys: Vec<StreamKey> = self.running.lock().keys().cloned().collect();
        for key in keys {
            self.stop_stream(&key).await;
        }
    }

    /// Sessions spawned for `key` that have not been stopped
    pub fn session_count(&self, key: &StreamKey) -> usize {
        self.running.lock().get(key).map_or(0, Vec::len)
    }

    pub fn active_stream_count(&self) -> usize {
        self.running.lock().len()
    }
}
