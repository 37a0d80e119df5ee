//! Op-log journal.
//!
//! Every change to the op-log store is one checksummed frame holding a CBOR
//! encoded [`JournalRecord`]. A frame is written in a single append and
//! synced before the change becomes visible, so a pulled batch and its
//! cursor advance land together or not at all.

use crate::error::{CoreError, CoreResult};
use crate::projector::Baseline;
use serde::{Deserialize, Serialize};
use shiftsync_protocol::{codec, ConflictId, EntityType, OpId, Operation, Resolution, SyncCursor};
use shiftsync_storage::{frame, StorageBackend};
use tracing::{debug, warn};

/// One durable change to the op-log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum JournalRecord {
    /// A locally recorded operation, not yet pushed.
    Append {
        /// The operation.
        op: Operation,
    },
    /// Operations received from elsewhere, with an optional cursor advance.
    RemoteBatch {
        /// New operations, already validated.
        ops: Vec<Operation>,
        /// Cursor to store once the operations are in.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<(EntityType, SyncCursor)>,
    },
    /// The authority acknowledged these operations.
    MarkPushed {
        /// Acknowledged operations.
        op_ids: Vec<OpId>,
    },
    /// Retention removed these operations after folding them into baselines.
    Pruned {
        /// Removed operations.
        op_ids: Vec<OpId>,
        /// Replacement baselines.
        baselines: Vec<Baseline>,
    },
    /// Cursor advance without new operations.
    CursorSet {
        /// Entity type.
        entity_type: EntityType,
        /// New cursor.
        cursor: SyncCursor,
    },
    /// Every cursor went back to the start.
    CursorsReset,
    /// A person settled a conflict.
    ConflictResolved {
        /// The conflict.
        conflict_id: ConflictId,
        /// The decision.
        resolution: Resolution,
    },
    /// A sync cycle completed.
    SyncRecorded {
        /// Wall-clock milliseconds.
        at: i64,
    },
}

impl JournalRecord {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            JournalRecord::Append { .. } => "append",
            JournalRecord::RemoteBatch { .. } => "remote_batch",
            JournalRecord::MarkPushed { .. } => "mark_pushed",
            JournalRecord::Pruned { .. } => "pruned",
            JournalRecord::CursorSet { .. } => "cursor_set",
            JournalRecord::CursorsReset => "cursors_reset",
            JournalRecord::ConflictResolved { .. } => "conflict_resolved",
            JournalRecord::SyncRecorded { .. } => "sync_recorded",
        }
    }
}

/// Append-only journal over a storage backend.
pub struct Journal {
    backend: Box<dyn StorageBackend>,
}

impl Journal {
    /// Opens the journal and returns every record in write order.
    ///
    /// A torn trailing frame, left by a crash mid-append, is cut off.
    ///
    /// # Errors
    ///
    /// Damage before the tail, or a frame that does not decode, is
    /// [`CoreError::JournalCorruption`].
    pub fn open(mut backend: Box<dyn StorageBackend>) -> CoreResult<(Self, Vec<JournalRecord>)> {
        let scan = frame::recover(backend.as_mut()).map_err(|e| {
            if e.is_corruption() {
                CoreError::journal_corruption(e.to_string())
            } else {
                CoreError::Storage(e)
            }
        })?;
        if scan.torn_tail {
            warn!(valid_len = scan.valid_len, "truncated torn journal tail");
        }

        let mut records = Vec::with_capacity(scan.frames.len());
        for f in scan.frames {
            let record: JournalRecord = codec::from_cbor(&f.payload).map_err(|e| {
                CoreError::journal_corruption(format!("undecodable record at offset {}: {e}", f.offset))
            })?;
            records.push(record);
        }
        debug!(records = records.len(), "journal opened");

        Ok((Self { backend }, records))
    }

    /// Durably appends a record and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails. Nothing is visible
    /// on failure.
    pub fn append(&mut self, record: &JournalRecord) -> CoreResult<u64> {
        let payload = codec::to_cbor(record)?;
        let offset = frame::append_frame(self.backend.as_mut(), &payload)?;
        debug!(kind = record.kind(), offset, "journal record written");
        Ok(offset)
    }

    /// Current size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("size", &self.backend.size().ok())
            .finish()
    }
}
