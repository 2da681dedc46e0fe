//! One stream pushed to one platform
//!
//! ```text
//! Connecting ──publish ok──► Relaying ──error──► Retrying ──backoff──► Connecting
//!      │                                            │
//!      └──── auth/url error or attempts exhausted ──┴──► Failed
//! ```
//!
//! Cancellation ends the session from any state without another attempt.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::client::{ClientConfig, RtmpConnector};
use crate::error::{Error, RelayError, Result};
use crate::registry::{Delivery, StreamKey, StreamRegistry};

use super::config::RelayConfig;
use super::status::{RelayState, RelayStatusBoard};
use super::target::RelayTarget;

/// How a connected attempt ended without error
enum RelayEnd {
    SourceEnded,
    Cancelled,
}

/// Why a relay session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The publisher ended the stream
    SourceEnded,
    Cancelled,
    /// Non-retryable error or attempts exhausted
    Failed,
}

pub struct RelaySession {
    id: u64,
    key: StreamKey,
    target: RelayTarget,
    registry: Arc<StreamRegistry>,
    config: RelayConfig,
    board: Arc<RelayStatusBoard>,
    cancel: CancellationToken,
    /// Consecutive failures since the last successful publish
    failures: u32,
}

impl RelaySession {
    pub fn new(
        id: u64,
        key: StreamKey,
        target: RelayTarget,
        registry: Arc<StreamRegistry>,
        config: RelayConfig,
        board: Arc<RelayStatusBoard>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            key,
            target,
            registry,
            config,
            board,
            cancel,
            failures: 0,
        }
    }

    /// Relay until the source ends, the session is cancelled or it fails
    pub async fn run(mut self) -> RelayExit {
        let cancel = self.cancel.clone();
        let client_config = match self.target.client_config(&self.config) {
            Ok(config) => config,
            Err(e) => return self.fail(&Error::from(e)),
        };

        loop {
            self.set_state(RelayState::Connecting);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Ok(RelayEnd::Cancelled),
                result = self.relay_once(&client_config) => result,
            };

            let error = match outcome {
                Ok(RelayEnd::SourceEnded) => {
                    tracing::info!(
                        session_id = self.id,
                        stream = %self.key,
                        platform = %self.target.platform,
                        "Source ended, relay finished"
                    );
                    return RelayExit::SourceEnded;
                }
                Ok(RelayEnd::Cancelled) => {
                    tracing::debug!(session_id = self.id, platform = %self.target.platform, "Relay cancelled");
                    return RelayExit::Cancelled;
                }
                Err(e) => e,
            };

            self.failures += 1;
            if !error.is_retryable() || !self.config.should_retry(self.failures) {
                return self.fail(&error);
            }

            let delay = self.config.backoff_delay(self.failures);
            self.set_state(RelayState::Retrying);
            self.board
                .record_error(&self.key, &self.target.platform, &error.to_string());
            tracing::warn!(
                session_id = self.id,
                stream = %self.key,
                platform = %self.target.platform,
                attempt = self.failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Relay failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return RelayExit::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn relay_once(&mut self, client_config: &ClientConfig) -> Result<RelayEnd> {
        let mut connector = RtmpConnector::connect(client_config.clone()).await?;
        let stream_key = client_config.stream_key().unwrap_or_default().to_string();
        connector.publish(&stream_key).await?;

        let mut subscription = self.registry.subscribe(&self.key, self.id);
        self.failures = 0;
        self.set_state(RelayState::Relaying);
        tracing::info!(
            session_id = self.id,
            stream = %self.key,
            platform = %self.target.platform,
            "Relaying"
        );

        for packet in subscription.take_catchup() {
            connector.send_packet(&packet).await?;
        }

        loop {
            tokio::select! {
                biased;
                delivery = subscription.recv() => match delivery {
                    Delivery::Packet(packet) => {
                        tracing::trace!(platform = %self.target.platform, sequence = packet.sequence, "Forward");
                        connector.send_packet(&packet).await?;
                    }
                    Delivery::Ended => return Ok(RelayEnd::SourceEnded),
                    Delivery::TooSlow => {
                        return Err(RelayError::Connect("target cannot keep up with the source".into()).into());
                    }
                },
                message = connector.next_message() => {
                    connector.handle_control(message?).await?;
                }
            }
        }
    }

    fn set_state(&self, state: RelayState) {
        self.board
            .set_state(&self.key, &self.target.platform, state, self.failures);
    }

    fn fail(&self, error: &Error) -> RelayExit {
        self.set_state(RelayState::Failed);
        self.board
            .record_error(&self.key, &self.target.platform, &error.to_string());
        tracing::error!(
            session_id = self.id,
            stream = %self.key,
            platform = %self.target.platform,
            attempts = self.failures,
            error = %error,
            "Relay failed"
        );
        RelayExit::Failed
    }
}
