//! Error types for the local replica.

use shiftsync_protocol::{
    ChainViolation, ConflictId, DeviceId, EntityId, EntityType, FieldPath, OpId, ProtocolError,
};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in replica operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] shiftsync_storage::StorageError),

    /// Encoding or validation error from the protocol layer.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A hash or chain link does not match. Never repaired automatically.
    #[error(transparent)]
    ChainIntegrityViolation(#[from] ChainViolation),

    /// A logical clock was duplicated or went backwards.
    #[error("causal ordering violation on {device_id} for {op_id}: clock {found} does not follow {previous}")]
    CausalOrderingViolation {
        /// Device that produced the operation.
        device_id: DeviceId,
        /// Offending operation.
        op_id: OpId,
        /// Clock of the preceding operation.
        previous: u64,
        /// Clock carried by the offending operation.
        found: u64,
    },

    /// A field holds a contention waiting for a person.
    #[error("merge conflict {conflict_id} on {entity_type}/{entity_id} at {field_path}")]
    MergeConflict {
        /// The pending conflict.
        conflict_id: ConflictId,
        /// Entity type.
        entity_type: EntityType,
        /// Entity.
        entity_id: EntityId,
        /// Contended field.
        field_path: FieldPath,
    },

    /// The persisted clock could not be read. No operation may be issued.
    #[error("causal clock unavailable: {reason}")]
    ClockUnavailable {
        /// Why the clock state is unusable.
        reason: String,
    },

    /// Local writes are refused after an integrity failure.
    #[error("device {device_id} quarantined: {reason}")]
    DeviceQuarantined {
        /// The local device.
        device_id: DeviceId,
        /// The integrity failure that caused it.
        reason: String,
    },

    /// The journal contains something it should not.
    #[error("journal corruption: {message}")]
    JournalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Merge rule configuration failed validation.
    #[error("invalid merge rules: {message}")]
    InvalidRegistry {
        /// What is wrong.
        message: String,
    },

    /// The request is not valid for this replica.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the request is invalid.
        message: String,
    },

    /// No operations exist for the entity.
    #[error("entity not found: {entity_type}/{entity_id}")]
    EntityNotFound {
        /// Entity type searched.
        entity_type: EntityType,
        /// Entity searched.
        entity_id: EntityId,
    },

    /// No conflict with that id is known.
    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    /// Another process holds the replica directory.
    #[error("replica locked: another process has exclusive access")]
    ReplicaLocked,
}

impl CoreError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a journal corruption error.
    pub fn journal_corruption(message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            message: message.into(),
        }
    }

    /// Creates a registry validation error.
    pub fn invalid_registry(message: impl Into<String>) -> Self {
        Self::InvalidRegistry {
            message: message.into(),
        }
    }

    /// Creates a clock failure.
    pub fn clock_unavailable(reason: impl Into<String>) -> Self {
        Self::ClockUnavailable {
            reason: reason.into(),
        }
    }

    /// Returns true for hash-chain and causal ordering violations.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            CoreError::ChainIntegrityViolation(_) | CoreError::CausalOrderingViolation { .. }
        )
    }
}
