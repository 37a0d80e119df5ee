//! Server-side op-log.

use crate::error::ServerResult;
use parking_lot::Mutex;
use shiftsync_core::{BatchVerdict, ChainCheck, OpLogStore, OperationPage, StoreStats};
use shiftsync_protocol::{ChainViolation, DeviceId, EntityType, Operation, SyncCursor};
use shiftsync_storage::{FileBackend, InMemoryBackend};
use std::path::Path;
use tracing::{debug, info};

/// The authority's operation log.
///
/// Every device chain is held to strict continuity: the first operation a
/// device pushes must be the first of its chain, and each later one must
/// link to the one stored before it.
pub struct ServerOplog {
    store: Mutex<OpLogStore>,
}

impl ServerOplog {
    /// Creates an empty, memory-backed op-log.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be initialised.
    pub fn in_memory() -> ServerResult<Self> {
        let store = OpLogStore::open(Box::new(InMemoryBackend::new()))?;
        Ok(Self {
            store: Mutex::new(store),
        })
    }

    /// Opens a file-backed op-log, replaying its journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its journal is
    /// corrupt.
    pub fn open(path: &Path) -> ServerResult<Self> {
        let backend = FileBackend::open(path).map_err(shiftsync_core::CoreError::from)?;
        let store = OpLogStore::open(Box::new(backend))?;
        info!(path = %path.display(), operations = store.iter().count(), "server op-log opened");
        Ok(Self {
            store: Mutex::new(store),
        })
    }

    /// Validates and stores pushed operations, returning a verdict per
    /// operation.
    ///
    /// # Errors
    ///
    /// Only storage failures are errors.
    pub fn append(&self, ops: &[Operation]) -> ServerResult<BatchVerdict> {
        let verdict = self.store.lock().append_partial(ops)?;
        debug!(
            accepted = verdict.accepted.len(),
            rejected = verdict.rejected.len(),
            "push judged"
        );
        Ok(verdict)
    }

    /// Up to `limit` operations of `entity_type` past `cursor`.
    pub fn page(&self, entity_type: EntityType, cursor: &SyncCursor, limit: usize) -> OperationPage {
        self.store.lock().operations_page(entity_type, cursor, limit)
    }

    /// Number of stored operations.
    pub fn len(&self) -> usize {
        self.store.lock().iter().count()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-checks every stored device chain.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn verify(&self) -> Result<(), ChainViolation> {
        self.store.lock().verify_chains(|_: &DeviceId| ChainCheck::Continuity)
    }

    /// Store counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal size cannot be read.
    pub fn stats(&self) -> ServerResult<StoreStats> {
        Ok(self.store.lock().stats()?)
    }
}

impl std::fmt::Debug for ServerOplog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOplog").field("operations", &self.len()).finish()
    }
}
