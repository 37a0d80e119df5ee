//! Configuration for the sync engine.

use shiftsync_protocol::{DeviceId, EntityType, PROTOCOL_VERSION};
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Device ID (unique per device).
    pub device_id: DeviceId,
    /// Protocol version.
    pub protocol_version: u16,
    /// Maximum operations requested per pull page.
    pub pull_batch_size: u32,
    /// Maximum operations sent per push request.
    pub push_batch_size: u32,
    /// Entity types pulled on every cycle.
    pub entity_types: Vec<EntityType>,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Interval of the periodic sync signal.
    pub sync_interval: Option<Duration>,
    /// Bound on every network call.
    pub timeout: Duration,
}

impl SyncConfig {
    /// Creates a new sync configuration pulling every entity type.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            protocol_version: PROTOCOL_VERSION,
            pull_batch_size: 500,
            push_batch_size: 200,
            entity_types: EntityType::ALL.to_vec(),
            retry: RetryConfig::default(),
            sync_interval: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the pull batch size.
    pub fn with_pull_batch_size(mut self, size: u32) -> Self {
        self.pull_batch_size = size;
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: u32) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Restricts pulls to the given entity types.
    pub fn with_entity_types(mut self, types: impl IntoIterator<Item = EntityType>) -> Self {
        self.entity_types = types.into_iter().collect();
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the sync interval for automatic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before a batch is quarantined.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// How long acknowledged entries are kept for inspection.
    pub acknowledged_ttl: Duration,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            acknowledged_ttl: Duration::from_secs(300),
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            acknowledged_ttl: Duration::from_secs(300),
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets how long acknowledged entries are retained.
    pub fn with_acknowledged_ttl(mut self, ttl: Duration) -> Self {
        self.acknowledged_ttl = ttl;
        self
    }

    /// Delay before retrying after failed attempt `attempt` (0-indexed):
    /// `min(base_delay * 2^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}
