//! Replica configuration.

use crate::clock::{SystemWallClock, WallClock};
use shiftsync_protocol::{ActorId, DeviceId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default reconciliation window for concurrent writes.
pub const DEFAULT_RECONCILIATION_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Default retention for pushed operations.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Configuration for opening a replica.
#[derive(Clone)]
pub struct ReplicaConfig {
    /// This device. Owns the local hash chain.
    pub device_id: DeviceId,
    /// Person recording operations through this replica.
    pub actor_id: ActorId,
    /// Two writes from different devices closer than this are concurrent.
    pub reconciliation_window: Duration,
    /// Pushed operations older than this may be pruned.
    pub retention: Duration,
    /// Whether to create the replica directory if it doesn't exist.
    pub create_if_missing: bool,
    /// Source of `client_timestamp` values.
    pub wall_clock: Arc<dyn WallClock>,
}

impl ReplicaConfig {
    /// Creates a configuration with default policy values.
    pub fn new(device_id: DeviceId, actor_id: ActorId) -> Self {
        Self {
            device_id,
            actor_id,
            reconciliation_window: DEFAULT_RECONCILIATION_WINDOW,
            retention: DEFAULT_RETENTION,
            create_if_missing: true,
            wall_clock: Arc::new(SystemWallClock),
        }
    }

    /// Sets the reconciliation window.
    #[must_use]
    pub fn with_reconciliation_window(mut self, window: Duration) -> Self {
        self.reconciliation_window = window;
        self
    }

    /// Sets the retention period for pushed operations.
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Sets whether to create a missing directory.
    #[must_use]
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Replaces the wall clock.
    #[must_use]
    pub fn with_wall_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.wall_clock = clock;
        self
    }

    /// Reconciliation window in milliseconds.
    #[must_use]
    pub fn window_ms(&self) -> i64 {
        i64::try_from(self.reconciliation_window.as_millis()).unwrap_or(i64::MAX)
    }

    /// Retention in milliseconds.
    #[must_use]
    pub fn retention_ms(&self) -> i64 {
        i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX)
    }
}

impl fmt::Debug for ReplicaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaConfig")
            .field("device_id", &self.device_id)
            .field("actor_id", &self.actor_id)
            .field("reconciliation_window", &self.reconciliation_window)
            .field("retention", &self.retention)
            .field("create_if_missing", &self.create_if_missing)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = ReplicaConfig::new(
            DeviceId::new("tablet-7").unwrap(),
            ActorId::new("shift-boss").unwrap(),
        )
        .with_reconciliation_window(Duration::from_secs(30))
        .with_retention(Duration::from_secs(3600))
        .create_if_missing(false);

        assert_eq!(config.window_ms(), 30_000);
        assert_eq!(config.retention_ms(), 3_600_000);
        assert!(!config.create_if_missing);
    }

    #[test]
    fn defaults() {
        let config = ReplicaConfig::new(DeviceId::new("d").unwrap(), ActorId::new("a").unwrap());
        assert_eq!(config.reconciliation_window, DEFAULT_RECONCILIATION_WINDOW);
        assert_eq!(config.retention_ms(), 90 * 24 * 60 * 60 * 1000);
    }
}
