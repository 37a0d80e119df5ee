//! Error types for the sync engine.

use shiftsync_protocol::{ProtocolError, RejectedOp};
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A network call exceeded its bound.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The authority refused the request or some of its operations.
    #[error("rejected by authority: {message}")]
    RejectedByAuthority {
        /// Summary from the authority.
        message: String,
        /// Per-operation verdicts, when the refusal came from a push.
        rejected: Vec<RejectedOp>,
    },

    /// The authority answered with something the client cannot use.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// The local replica failed.
    #[error("replica error: {0}")]
    Core(#[from] shiftsync_core::CoreError),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// Version mismatch.
    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Local protocol version.
        local: u16,
        /// Remote protocol version.
        remote: u16,
    },
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a refusal without per-operation verdicts.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::RejectedByAuthority {
            message: message.into(),
            rejected: Vec::new(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout(_) | SyncError::NotConnected => true,
            _ => false,
        }
    }

    /// Returns true if the authority refused the request as invalid.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SyncError::RejectedByAuthority { .. } | SyncError::VersionMismatch { .. }
        )
    }
}
