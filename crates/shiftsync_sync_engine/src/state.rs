//! Sync engine state machine.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use parking_lot::RwLock;
use shiftsync_protocol::{
    EntityType, HandshakeRequest, OpId, Operation, PullRequest, PushRequest, SyncCursor,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is connecting to the server.
    Connecting,
    /// Engine is pushing local operations.
    Pushing,
    /// Engine is pulling operations from the server.
    Pulling,
    /// Engine has completed a sync cycle.
    Synced,
    /// Engine encountered an error.
    Error,
    /// Engine is waiting before retrying.
    RetryWait,
}

impl SyncState {
    /// Returns true if the engine is in an active sync state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Connecting | SyncState::Pushing | SyncState::Pulling
        )
    }

    /// Returns true if the engine can start a new sync.
    pub fn can_start_sync(&self) -> bool {
        matches!(
            self,
            SyncState::Idle | SyncState::Synced | SyncState::Error | SyncState::RetryWait
        )
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Total number of operations pulled.
    pub operations_pulled: u64,
    /// Total number of operations acknowledged by the authority.
    pub operations_pushed: u64,
    /// Total number of operations refused by the authority.
    pub operations_rejected: u64,
    /// Total number of retries.
    pub retries: u64,
    /// Last sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a sync cycle.
#[derive(Debug, Clone)]
pub struct SyncCycleResult {
    /// Number of operations pulled.
    pub pulled: u64,
    /// Number of operations acknowledged.
    pub pushed: u64,
    /// Duration of the sync cycle.
    pub duration: Duration,
}

/// The local side of a sync: where pending operations come from and where
/// pulled ones go.
pub trait SyncApplier: Send + Sync {
    /// Up to `limit` unpushed local operations in chain order.
    fn pending_operations(&self, limit: usize) -> SyncResult<Vec<Operation>>;

    /// Marks operations as acknowledged by the authority. Returns how many
    /// were newly marked.
    fn acknowledge(&self, op_ids: &[OpId]) -> SyncResult<usize>;

    /// Stored pull cursor of an entity type.
    fn cursor(&self, entity_type: EntityType) -> SyncResult<SyncCursor>;

    /// Applies a pulled page and stores its cursor, all or nothing.
    /// Returns how many operations were new.
    fn apply_page(
        &self,
        entity_type: EntityType,
        ops: &[Operation],
        next_cursor: SyncCursor,
    ) -> SyncResult<usize>;

    /// Records the end of a successful cycle.
    fn sync_completed(&self) -> SyncResult<()>;
}

/// The sync engine manages synchronization with the remote authority.
pub struct SyncEngine<T: SyncTransport, A: SyncApplier> {
    config: SyncConfig,
    transport: Arc<T>,
    applier: Arc<A>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
    negotiated: tokio::sync::Mutex<bool>,
}

impl<T: SyncTransport, A: SyncApplier> SyncEngine<T, A> {
    /// Creates a new sync engine.
    pub fn new(config: SyncConfig, transport: T, applier: Arc<A>) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
            applier,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
            negotiated: tokio::sync::Mutex::new(false),
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Cancels any ongoing sync operation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Resets the cancelled flag.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Bounds a network call by the configured timeout.
    async fn call<R>(&self, request: impl Future<Output = SyncResult<R>>) -> SyncResult<R> {
        match tokio::time::timeout(self.config.timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.config.timeout)),
        }
    }

    /// Performs a full sync cycle: handshake, push, then pull every
    /// configured entity type.
    pub async fn sync(&self) -> SyncResult<SyncCycleResult> {
        {
            let mut state = self.state.write();
            if !state.can_start_sync() {
                return Err(SyncError::InvalidStateTransition {
                    from: format!("{:?}", *state),
                    to: "Connecting".into(),
                });
            }
            *state = SyncState::Connecting;
        }
        self.reset_cancel();

        match self.run_cycle().await {
            Ok(result) => {
                self.set_state(SyncState::Synced);
                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.last_sync_time = Some(Instant::now());
                stats.last_error = None;
                info!(
                    pushed = result.pushed,
                    pulled = result.pulled,
                    ms = result.duration.as_millis() as u64,
                    "sync cycle complete"
                );
                Ok(result)
            }
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    async fn run_cycle(&self) -> SyncResult<SyncCycleResult> {
        let start = Instant::now();

        self.forget_handshake().await;
        self.ensure_handshake().await?;
        self.check_cancelled()?;

        self.set_state(SyncState::Pushing);
        let pushed = self.push_pending().await?;
        self.check_cancelled()?;

        self.set_state(SyncState::Pulling);
        let mut pulled = 0;
        for entity_type in self.config.entity_types.clone() {
            pulled += self.pull_entity(entity_type).await?;
        }

        self.applier.sync_completed()?;
        Ok(SyncCycleResult {
            pulled,
            pushed,
            duration: start.elapsed(),
        })
    }

    /// Performs a sync, retrying transient failures with backoff.
    pub async fn sync_with_retry(&self) -> SyncResult<SyncCycleResult> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match self.sync().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, error = %e, "sync failed, retrying");
                    self.set_state(SyncState::RetryWait);
                    self.stats.write().retries += 1;
                    tokio::time::sleep(delay).await;
                    self.check_cancelled()?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handshakes with the authority unless an earlier handshake still holds.
    ///
    /// Concurrent callers wait for a single handshake.
    ///
    /// # Errors
    ///
    /// [`SyncError::VersionMismatch`] or [`SyncError::RejectedByAuthority`]
    /// when the authority refuses this device, or the transport error.
    pub async fn ensure_handshake(&self) -> SyncResult<()> {
        let mut negotiated = self.negotiated.lock().await;
        if !*negotiated {
            self.handshake().await?;
            debug!(device = %self.config.device_id, "handshake accepted");
            *negotiated = true;
        }
        Ok(())
    }

    /// Makes the next [`ensure_handshake`](Self::ensure_handshake) contact
    /// the authority again.
    pub async fn forget_handshake(&self) {
        *self.negotiated.lock().await = false;
    }

    async fn handshake(&self) -> SyncResult<()> {
        let request = HandshakeRequest {
            device_id: self.config.device_id.clone(),
            protocol_version: self.config.protocol_version,
        };
        let response = self.call(self.transport.handshake(&request)).await?;

        if response.protocol_version != self.config.protocol_version {
            return Err(SyncError::VersionMismatch {
                local: self.config.protocol_version,
                remote: response.protocol_version,
            });
        }
        if !response.accepted {
            return Err(SyncError::rejected(
                response.message.unwrap_or_else(|| "handshake refused".into()),
            ));
        }
        Ok(())
    }

    /// Pushes every pending local operation in batches.
    ///
    /// Only operations the authority accepted are marked as pushed. If any
    /// were refused the push stops with [`SyncError::RejectedByAuthority`]
    /// carrying the verdicts.
    pub async fn push_pending(&self) -> SyncResult<u64> {
        let mut total_pushed = 0u64;

        loop {
            self.check_cancelled()?;

            let ops = self
                .applier
                .pending_operations(self.config.push_batch_size as usize)?;
            if ops.is_empty() {
                break;
            }

            let request = PushRequest {
                device_id: self.config.device_id.clone(),
                ops,
            };
            let response = self.call(self.transport.push(&request)).await?;

            let accepted: Vec<OpId> = response
                .accepted
                .iter()
                .filter(|id| request.ops.iter().any(|op| op.op_id == **id))
                .copied()
                .collect();
            let marked = self.applier.acknowledge(&accepted)?;
            total_pushed += marked as u64;
            self.stats.write().operations_pushed += marked as u64;
            debug!(sent = request.ops.len(), accepted = marked, "push batch acknowledged");

            if !response.rejected.is_empty() {
                self.stats.write().operations_rejected += response.rejected.len() as u64;
                let first = &response.rejected[0];
                return Err(SyncError::RejectedByAuthority {
                    message: format!(
                        "{} of {} operations refused, first {}: {}",
                        response.rejected.len(),
                        request.ops.len(),
                        first.op_id,
                        first.reason
                    ),
                    rejected: response.rejected,
                });
            }
            if marked == 0 {
                return Err(SyncError::Protocol(
                    "authority acknowledged none of the pushed operations".into(),
                ));
            }
        }

        Ok(total_pushed)
    }

    /// Pulls every page of one entity type.
    ///
    /// Each page is applied and its cursor stored atomically; a failure
    /// leaves the cursor at the last fully applied page.
    pub async fn pull_entity(&self, entity_type: EntityType) -> SyncResult<u64> {
        let mut total_pulled = 0u64;

        loop {
            self.check_cancelled()?;

            let cursor = self.applier.cursor(entity_type)?;
            let request = PullRequest {
                entity_type,
                cursor,
                limit: self.config.pull_batch_size,
            };
            let response = self.call(self.transport.pull(&request)).await?;

            if response.entity_type != entity_type {
                return Err(SyncError::Protocol(format!(
                    "asked for {entity_type}, received {}",
                    response.entity_type
                )));
            }
            if !response.ops.is_empty() || response.next_cursor != cursor {
                let fresh = self
                    .applier
                    .apply_page(entity_type, &response.ops, response.next_cursor)?;
                total_pulled += response.ops.len() as u64;
                self.stats.write().operations_pulled += response.ops.len() as u64;
                debug!(%entity_type, received = response.ops.len(), fresh, "pull page applied");
            }

            if !response.has_more {
                break;
            }
            if response.ops.is_empty() {
                return Err(SyncError::Protocol(
                    "authority reported more operations but sent none".into(),
                ));
            }
        }

        Ok(total_pulled)
    }

    /// Handles an error by updating state and stats.
    fn handle_error(&self, error: &SyncError) {
        warn!(error = %error, "sync cycle failed");
        self.set_state(SyncState::Error);
        self.stats.write().last_error = Some(error.to_string());
    }
}
