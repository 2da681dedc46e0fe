//! Relay retry and timeout settings

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP connect deadline per attempt
    pub connect_timeout: Duration,

    /// Deadline for each reply from the target during connect/publish
    pub response_timeout: Duration,

    /// Deadline for each packet write; a target that stops reading is
    /// treated as a failed attempt
    pub write_timeout: Duration,

    /// Delay after the first failure, doubled per consecutive failure
    pub initial_backoff: Duration,

    pub max_backoff: Duration,

    /// Consecutive failures before a session gives up (0 = never)
    pub max_attempts: u32,

    /// Chunk size used towards the target
    pub chunk_size: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
            max_attempts: 10,
            chunk_size: 60_000,
        }
    }
}

impl RelayConfig {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Delay before retrying after `failures` consecutive failures (>= 1)
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures
    pub fn should_retry(&self, failures: u32) -> bool {
        self.max_attempts == 0 || failures < self.max_attempts
    }
}
