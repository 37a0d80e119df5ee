//! Per-entity-type pull cursors.

use crate::ids::OpId;
use serde::{Deserialize, Serialize};

/// Where a client stands in the authority's log for one entity type.
///
/// `position` is the authority's arrival sequence number of the last
/// delivered operation. Paging by arrival rather than by causal key means
/// an operation that reaches the authority late, carrying an old logical
/// clock, is still delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Last operation delivered, if any.
    pub last_op_id: Option<OpId>,
    /// Client timestamp of that operation.
    pub last_timestamp: i64,
    /// Arrival position of that operation at the authority.
    pub position: u64,
}

impl SyncCursor {
    /// The cursor before anything has been pulled.
    #[must_use]
    pub const fn start() -> Self {
        Self {
            last_op_id: None,
            last_timestamp: 0,
            position: 0,
        }
    }

    /// Returns true if nothing has been pulled yet.
    #[must_use]
    pub fn is_start(&self) -> bool {
        self.last_op_id.is_none() && self.position == 0
    }

    /// Returns true if `self` is at or past `other`.
    #[must_use]
    pub fn has_reached(&self, other: &SyncCursor) -> bool {
        self.position >= other.position
    }
}
