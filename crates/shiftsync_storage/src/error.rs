//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Truncation target lies past the end of storage.
    #[error("cannot truncate to {requested} bytes, storage holds {size}")]
    TruncatePastEnd {
        /// Requested new size.
        requested: u64,
        /// Current size.
        size: u64,
    },

    /// A frame before the tail failed validation.
    #[error("corrupt frame at offset {offset}: {reason}")]
    CorruptFrame {
        /// Offset of the frame header.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// A payload does not fit a frame.
    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),
}

impl StorageError {
    /// Returns true if this error means stored bytes are damaged rather
    /// than temporarily unreadable.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::CorruptFrame { .. })
    }
}
