//! Retry bookkeeping for sync batches.
//!
//! Each batch key moves through `Pending → InFlight → {Acknowledged | Failed}`.
//! A failed batch waits `min(base_delay * 2^attempt, max_delay)` before it
//! is due again. Once it has used up its attempts, or fails with an error
//! that is not worth retrying, it moves to the quarantined set where it
//! stays, inspectable, until released by hand.
//!
//! The queue is a plain state machine over [`Instant`]s; the
//! [`RetryWorker`](crate::RetryWorker) drives it.

use crate::config::RetryConfig;
use crate::error::SyncError;
use shiftsync_protocol::EntityType;
use std::collections::BTreeMap;
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Unit of retry scheduling. At most one attempt per key is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BatchKey {
    /// Pushing this device's unpushed operations.
    Push,
    /// Pulling one entity type.
    Pull(EntityType),
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchKey::Push => f.write_str("push"),
            BatchKey::Pull(entity_type) => write!(f, "pull:{entity_type}"),
        }
    }
}

/// Where a batch stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Waiting for its first attempt.
    Pending,
    /// An attempt is running.
    InFlight,
    /// The last attempt succeeded.
    Acknowledged,
    /// The last attempt failed; waiting for the backoff to pass.
    Failed,
}

/// A scheduled batch.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    /// Batch key.
    pub key: BatchKey,
    /// Current state.
    pub state: BatchState,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Earliest time of the next attempt.
    pub next_attempt: Instant,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
    /// When the state last changed.
    pub updated: Instant,
    rerun: bool,
}

impl BatchEntry {
    fn fresh(key: BatchKey, now: Instant) -> Self {
        Self {
            key,
            state: BatchState::Pending,
            attempts: 0,
            next_attempt: now,
            last_error: None,
            updated: now,
            rerun: false,
        }
    }

    fn is_waiting(&self) -> bool {
        matches!(self.state, BatchState::Pending | BatchState::Failed)
    }
}

/// A batch that is no longer retried automatically.
#[derive(Debug, Clone)]
pub struct QuarantinedBatch {
    /// Batch key.
    pub key: BatchKey,
    /// Attempts made.
    pub attempts: u32,
    /// Error of the final attempt.
    pub last_error: String,
    /// When it was quarantined.
    pub quarantined_at: Instant,
}

/// What happens after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The batch is due again at this time.
    RetryAt(Instant),
    /// The batch was quarantined.
    Quarantined,
}

/// Counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    /// Waiting for a first attempt.
    pub pending: usize,
    /// Attempts running.
    pub in_flight: usize,
    /// Recently succeeded.
    pub acknowledged: usize,
    /// Waiting out a backoff.
    pub failed: usize,
    /// No longer retried.
    pub quarantined: usize,
}

/// Backoff scheduler for sync batches.
#[derive(Debug)]
pub struct RetryQueue {
    config: RetryConfig,
    entries: BTreeMap<BatchKey, BatchEntry>,
    quarantined: BTreeMap<BatchKey, QuarantinedBatch>,
}

impl RetryQueue {
    /// Creates an empty queue.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            entries: BTreeMap::new(),
            quarantined: BTreeMap::new(),
        }
    }

    /// Asks for an attempt of `key`.
    ///
    /// A batch already waiting keeps its schedule, so a burst of signals
    /// cannot cut a backoff short. A batch in flight is rerun once the
    /// current attempt succeeds. Returns false if the key is quarantined.
    pub fn enqueue(&mut self, key: BatchKey, now: Instant) -> bool {
        if self.quarantined.contains_key(&key) {
            return false;
        }
        match self.entries.get_mut(&key) {
            None => {
                self.entries.insert(key, BatchEntry::fresh(key, now));
            }
            Some(entry) => match entry.state {
                BatchState::Acknowledged => *entry = BatchEntry::fresh(key, now),
                BatchState::InFlight => entry.rerun = true,
                BatchState::Pending | BatchState::Failed => {}
            },
        }
        true
    }

    /// Keys whose next attempt is due.
    pub fn due(&self, now: Instant) -> Vec<BatchKey> {
        self.entries
            .values()
            .filter(|e| e.is_waiting() && e.next_attempt <= now)
            .map(|e| e.key)
            .collect()
    }

    /// Marks `key` in flight. Refused unless it is due and not already
    /// running.
    pub fn begin(&mut self, key: BatchKey, now: Instant) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) if entry.is_waiting() && entry.next_attempt <= now => {
                entry.state = BatchState::InFlight;
                entry.rerun = false;
                entry.updated = now;
                true
            }
            _ => false,
        }
    }

    /// Records a successful attempt.
    pub fn acknowledge(&mut self, key: BatchKey, now: Instant) {
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };
        if entry.state != BatchState::InFlight {
            return;
        }
        if entry.rerun {
            *entry = BatchEntry::fresh(key, now);
        } else {
            entry.state = BatchState::Acknowledged;
            entry.attempts = 0;
            entry.last_error = None;
            entry.updated = now;
        }
    }

    /// Records a failed attempt and decides what comes next.
    ///
    /// Returns `None` if `key` was not in flight.
    pub fn fail(&mut self, key: BatchKey, now: Instant, error: &SyncError) -> Option<RetryDecision> {
        let entry = self.entries.get_mut(&key)?;
        if entry.state != BatchState::InFlight {
            return None;
        }
        let failed_attempt = entry.attempts;
        entry.attempts += 1;

        if !error.is_retryable() || entry.attempts >= self.config.max_attempts {
            let attempts = entry.attempts;
            self.entries.remove(&key);
            warn!(%key, attempts, error = %error, "batch quarantined");
            self.quarantined.insert(
                key,
                QuarantinedBatch {
                    key,
                    attempts,
                    last_error: error.to_string(),
                    quarantined_at: now,
                },
            );
            return Some(RetryDecision::Quarantined);
        }

        let at = now + self.config.delay_for_attempt(failed_attempt);
        entry.state = BatchState::Failed;
        entry.next_attempt = at;
        entry.last_error = Some(error.to_string());
        entry.updated = now;
        debug!(%key, attempt = entry.attempts, "batch failed, retry scheduled");
        Some(RetryDecision::RetryAt(at))
    }

    /// Earliest time a waiting batch becomes due.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|e| e.is_waiting())
            .map(|e| e.next_attempt)
            .min()
    }

    /// The schedule entry of `key`.
    pub fn entry(&self, key: BatchKey) -> Option<&BatchEntry> {
        self.entries.get(&key)
    }

    /// Batches that are no longer retried automatically.
    pub fn quarantined(&self) -> impl Iterator<Item = &QuarantinedBatch> {
        self.quarantined.values()
    }

    /// Moves a quarantined batch back to pending with a fresh attempt
    /// budget. Returns false if `key` was not quarantined.
    pub fn release(&mut self, key: BatchKey, now: Instant) -> bool {
        if self.quarantined.remove(&key).is_none() {
            return false;
        }
        self.entries.insert(key, BatchEntry::fresh(key, now));
        true
    }

    /// Forgets every quarantined batch. Returns how many there were.
    pub fn clear_quarantined(&mut self) -> usize {
        let n = self.quarantined.len();
        self.quarantined.clear();
        n
    }

    /// Drops acknowledged entries older than the configured TTL.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let ttl = self.config.acknowledged_ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.state != BatchState::Acknowledged || e.updated + ttl > now);
        before - self.entries.len()
    }

    /// Counts per state.
    pub fn status(&self) -> QueueStatus {
        let mut status = QueueStatus {
            quarantined: self.quarantined.len(),
            ..QueueStatus::default()
        };
        for entry in self.entries.values() {
            match entry.state {
                BatchState::Pending => status.pending += 1,
                BatchState::InFlight => status.in_flight += 1,
                BatchState::Acknowledged => status.acknowledged += 1,
                BatchState::Failed => status.failed += 1,
            }
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue() -> RetryQueue {
        RetryQueue::new(RetryConfig::new(3))
    }

    fn flaky() -> SyncError {
        SyncError::transport_retryable("connection reset")
    }

    #[test]
    fn backoff_doubles_then_quarantines() {
        let mut q = queue();
        let t0 = Instant::now();
        let key = BatchKey::Pull(EntityType::Shift);
        assert!(q.enqueue(key, t0));
        assert_eq!(q.due(t0), vec![key]);

        assert!(q.begin(key, t0));
        assert_eq!(
            q.fail(key, t0, &flaky()),
            Some(RetryDecision::RetryAt(t0 + Duration::from_secs(1)))
        );
        assert!(q.due(t0).is_empty());
        assert_eq!(q.next_wakeup(), Some(t0 + Duration::from_secs(1)));

        let t1 = t0 + Duration::from_secs(1);
        assert!(q.begin(key, t1));
        assert_eq!(
            q.fail(key, t1, &flaky()),
            Some(RetryDecision::RetryAt(t1 + Duration::from_secs(2)))
        );

        let t2 = t1 + Duration::from_secs(2);
        assert!(q.begin(key, t2));
        assert_eq!(q.fail(key, t2, &flaky()), Some(RetryDecision::Quarantined));

        assert!(q.due(t2 + Duration::from_secs(3600)).is_empty());
        assert_eq!(q.next_wakeup(), None);
        let held: Vec<_> = q.quarantined().collect();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].attempts, 3);
        assert!(held[0].last_error.contains("connection reset"));
    }

    #[test]
    fn non_retryable_failure_quarantines_at_once() {
        let mut q = queue();
        let t0 = Instant::now();
        q.enqueue(BatchKey::Push, t0);
        q.begin(BatchKey::Push, t0);
        let decision = q.fail(BatchKey::Push, t0, &SyncError::rejected("bad chain"));
        assert_eq!(decision, Some(RetryDecision::Quarantined));
        assert!(!q.enqueue(BatchKey::Push, t0));
        assert_eq!(q.status().quarantined, 1);
    }

    #[test]
    fn single_attempt_in_flight_per_key() {
        let mut q = queue();
        let t0 = Instant::now();
        q.enqueue(BatchKey::Push, t0);
        assert!(q.begin(BatchKey::Push, t0));
        assert!(!q.begin(BatchKey::Push, t0));
        assert!(q.due(t0).is_empty());

        // A signal while in flight schedules one rerun.
        q.enqueue(BatchKey::Push, t0);
        q.acknowledge(BatchKey::Push, t0);
        assert_eq!(q.entry(BatchKey::Push).unwrap().state, BatchState::Pending);
        assert!(q.begin(BatchKey::Push, t0));
        q.acknowledge(BatchKey::Push, t0);
        assert_eq!(q.entry(BatchKey::Push).unwrap().state, BatchState::Acknowledged);
    }

    #[test]
    fn signals_do_not_shorten_backoff() {
        let mut q = queue();
        let t0 = Instant::now();
        q.enqueue(BatchKey::Push, t0);
        q.begin(BatchKey::Push, t0);
        q.fail(BatchKey::Push, t0, &flaky());

        q.enqueue(BatchKey::Push, t0);
        assert!(q.due(t0).is_empty());
        assert_eq!(q.status().failed, 1);
    }

    #[test]
    fn release_restores_attempt_budget() {
        let mut q = queue();
        let t0 = Instant::now();
        q.enqueue(BatchKey::Push, t0);
        q.begin(BatchKey::Push, t0);
        q.fail(BatchKey::Push, t0, &SyncError::rejected("refused"));

        assert!(q.release(BatchKey::Push, t0));
        assert!(!q.release(BatchKey::Push, t0));
        let entry = q.entry(BatchKey::Push).unwrap();
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.state, BatchState::Pending);
        assert_eq!(q.status().quarantined, 0);
    }

    #[test]
    fn acknowledged_entries_expire() {
        let mut q = RetryQueue::new(RetryConfig::new(3).with_acknowledged_ttl(Duration::from_secs(60)));
        let t0 = Instant::now();
        q.enqueue(BatchKey::Push, t0);
        q.begin(BatchKey::Push, t0);
        q.acknowledge(BatchKey::Push, t0);

        assert_eq!(q.purge_expired(t0 + Duration::from_secs(59)), 0);
        assert_eq!(q.purge_expired(t0 + Duration::from_secs(60)), 1);
        assert_eq!(q.status(), QueueStatus::default());
    }

    #[test]
    fn clear_quarantined_counts() {
        let mut q = queue();
        let t0 = Instant::now();
        for key in [BatchKey::Push, BatchKey::Pull(EntityType::Action)] {
            q.enqueue(key, t0);
            q.begin(key, t0);
            q.fail(key, t0, &SyncError::Cancelled);
        }
        assert_eq!(q.clear_quarantined(), 2);
        assert_eq!(q.quarantined().count(), 0);
    }
}
