//! The replica as the local side of a sync.

use crate::error::SyncResult;
use crate::state::SyncApplier;
use shiftsync_core::Replica;
use shiftsync_protocol::{EntityType, OpId, Operation, SyncCursor};

impl SyncApplier for Replica {
    fn pending_operations(&self, limit: usize) -> SyncResult<Vec<Operation>> {
        Ok(self.pending_push(limit))
    }

    fn acknowledge(&self, op_ids: &[OpId]) -> SyncResult<usize> {
        Ok(self.mark_pushed(op_ids)?)
    }

    fn cursor(&self, entity_type: EntityType) -> SyncResult<SyncCursor> {
        Ok(Replica::cursor(self, entity_type))
    }

    fn apply_page(
        &self,
        entity_type: EntityType,
        ops: &[Operation],
        next_cursor: SyncCursor,
    ) -> SyncResult<usize> {
        Ok(self.apply_pull(entity_type, ops, next_cursor)?.appended)
    }

    fn sync_completed(&self) -> SyncResult<()> {
        Ok(self.record_sync_time()?)
    }
}
