//! Op-log store.
//!
//! The append-only ledger every replica and the authority keep. The journal
//! is the durable form; everything else here is an index rebuilt on open.
//!
//! Two chain checks exist. **Continuity** is the full check: an operation
//! must link to its device's current tip and carry a larger logical clock.
//! It applies to the local device's own writes and to every device on the
//! authority. **Linkage** applies to operations a client pulls for other
//! devices. Pulls are per entity type, so a client only ever sees a
//! subsequence of a foreign chain; it can check each digest, refuse forks
//! and check the clock against a predecessor it happens to hold.

use crate::clock::MAX_LOGICAL_CLOCK;
use crate::error::{CoreError, CoreResult};
use crate::journal::{Journal, JournalRecord};
use crate::projector::Baseline;
use shiftsync_protocol::{
    ChainHash, ChainViolation, ConflictId, DeviceId, EntityId, EntityType, OpId, Operation,
    RejectReason, RejectedOp, Resolution, SyncCursor, ViolationKind,
};
use shiftsync_storage::StorageBackend;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Identifies one entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: EntityId,
}

impl EntityKey {
    /// Creates a key.
    #[must_use]
    pub fn new(entity_type: EntityType, entity_id: EntityId) -> Self {
        Self {
            entity_type,
            entity_id,
        }
    }

    /// Key of the entity an operation targets.
    #[must_use]
    pub fn of(op: &Operation) -> Self {
        Self::new(op.entity_type, op.entity_id.clone())
    }
}

/// A stored operation with its local bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalOperation {
    /// The operation.
    pub op: Operation,
    /// Whether the authority has acknowledged it.
    pub pushed: bool,
    /// Arrival sequence number in this store, starting at 1.
    pub position: u64,
}

/// Latest known operation of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    /// The operation.
    pub op_id: OpId,
    /// Its digest.
    pub hash: ChainHash,
    /// Its logical clock.
    pub logical_clock: u64,
}

/// Which chain check an incoming operation gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainCheck {
    /// Must extend the device tip.
    Continuity,
    /// Must not fork and must be internally consistent.
    Linkage,
}

/// What an append did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The operation is new and was stored.
    Appended,
    /// The operation was already stored; nothing changed.
    Duplicate,
}

/// A page of operations for one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationPage {
    /// Operations, sorted causally.
    pub ops: Vec<Operation>,
    /// Cursor after the last operation in arrival order.
    pub next_cursor: SyncCursor,
    /// Whether more operations follow.
    pub has_more: bool,
}

/// Counts for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    /// Operations currently stored.
    pub operations: usize,
    /// Operations not yet acknowledged by the authority.
    pub unpushed: usize,
    /// Devices with a known chain.
    pub devices: usize,
    /// Entities with operations or a baseline.
    pub entities: usize,
    /// Entities with a pruned baseline.
    pub baselines: usize,
    /// Journal size in bytes.
    pub journal_bytes: u64,
}

/// Chain state that validation reads and updates. The store keeps one;
/// batch validation works on a scratch copy of the entries it touches.
#[derive(Debug, Default, Clone)]
struct ChainIndex {
    tips: HashMap<DeviceId, ChainTip>,
    /// `(device, prev_hash)` to the operation holding that link.
    links: HashMap<(DeviceId, Option<ChainHash>), OpId>,
    /// Digest to logical clock, for predecessor checks.
    clocks: HashMap<ChainHash, u64>,
    /// Every operation ever stored, pruned ones included.
    known: HashMap<OpId, ChainHash>,
}

impl ChainIndex {
    fn record(&mut self, op: &Operation) {
        self.known.insert(op.op_id, op.hash);
        self.links
            .insert((op.device_id.clone(), op.prev_hash), op.op_id);
        self.clocks.insert(op.hash, op.logical_clock);
        let advance = self
            .tips
            .get(&op.device_id)
            .map_or(true, |t| op.logical_clock > t.logical_clock);
        if advance {
            self.tips.insert(
                op.device_id.clone(),
                ChainTip {
                    op_id: op.op_id,
                    hash: op.hash,
                    logical_clock: op.logical_clock,
                },
            );
        }
    }
}

/// Overlay used to validate a batch before anything is written.
struct Staging<'a> {
    base: &'a ChainIndex,
    local: ChainIndex,
}

impl<'a> Staging<'a> {
    fn new(base: &'a ChainIndex) -> Self {
        Self {
            base,
            local: ChainIndex::default(),
        }
    }

    fn known(&self, op_id: &OpId) -> Option<ChainHash> {
        self.local
            .known
            .get(op_id)
            .or_else(|| self.base.known.get(op_id))
            .copied()
    }

    fn tip(&self, device: &DeviceId) -> Option<ChainTip> {
        self.local
            .tips
            .get(device)
            .or_else(|| self.base.tips.get(device))
            .copied()
    }

    fn link(&self, device: &DeviceId, prev: Option<ChainHash>) -> Option<OpId> {
        let key = (device.clone(), prev);
        self.local
            .links
            .get(&key)
            .or_else(|| self.base.links.get(&key))
            .copied()
    }

    fn clock_of(&self, hash: &ChainHash) -> Option<u64> {
        self.local
            .clocks
            .get(hash)
            .or_else(|| self.base.clocks.get(hash))
            .copied()
    }

    /// Validates `op` and, if it is new, records it in the overlay.
    fn admit(&mut self, op: &Operation, check: ChainCheck) -> CoreResult<AppendOutcome> {
        let violation = |kind| {
            CoreError::ChainIntegrityViolation(ChainViolation {
                device_id: op.device_id.clone(),
                index: 0,
                op_id: op.op_id,
                kind,
                rejected: vec![op.op_id],
            })
        };

        if let Some(stored) = self.known(&op.op_id) {
            if stored == op.hash {
                return Ok(AppendOutcome::Duplicate);
            }
            return Err(violation(ViolationKind::ReusedOpId {
                stored,
                incoming: op.hash,
            }));
        }

        if op.logical_clock > MAX_LOGICAL_CLOCK {
            return Err(CoreError::invalid_operation(format!(
                "{} carries logical clock {}, beyond the usable range",
                op.op_id, op.logical_clock
            )));
        }

        let computed = op.recompute_hash()?;
        if computed != op.hash {
            return Err(violation(ViolationKind::HashMismatch {
                stored: op.hash,
                computed,
            }));
        }

        match check {
            ChainCheck::Continuity => {
                let tip = self.tip(&op.device_id);
                let expected = tip.map(|t| t.hash);
                if op.prev_hash != expected {
                    return Err(violation(ViolationKind::PrevHashMismatch {
                        expected,
                        found: op.prev_hash,
                    }));
                }
                if let Some(t) = tip {
                    if op.logical_clock <= t.logical_clock {
                        return Err(CoreError::CausalOrderingViolation {
                            device_id: op.device_id.clone(),
                            op_id: op.op_id,
                            previous: t.logical_clock,
                            found: op.logical_clock,
                        });
                    }
                }
            }
            ChainCheck::Linkage => {
                if let Some(existing) = self.link(&op.device_id, op.prev_hash) {
                    return Err(violation(ViolationKind::Fork { existing }));
                }
                if let Some(previous) = op.prev_hash.as_ref().and_then(|h| self.clock_of(h)) {
                    if op.logical_clock <= previous {
                        return Err(CoreError::CausalOrderingViolation {
                            device_id: op.device_id.clone(),
                            op_id: op.op_id,
                            previous,
                            found: op.logical_clock,
                        });
                    }
                }
            }
        }

        self.local.record(op);
        Ok(AppendOutcome::Appended)
    }
}

/// Maps a validation failure to the reason the authority reports.
#[must_use]
pub fn reject_reason(err: &CoreError) -> RejectReason {
    match err {
        CoreError::ChainIntegrityViolation(v) => match &v.kind {
            ViolationKind::HashMismatch { .. } => RejectReason::HashMismatch,
            ViolationKind::PrevHashMismatch { expected, found } => RejectReason::BrokenChain {
                expected: *expected,
                found: *found,
            },
            ViolationKind::ReusedOpId { .. } => RejectReason::ConflictingDuplicate,
            other => RejectReason::Malformed {
                message: other.to_string(),
            },
        },
        CoreError::CausalOrderingViolation {
            previous, found, ..
        } => RejectReason::ClockRegression {
            tip: *previous,
            found: *found,
        },
        other => RejectReason::Malformed {
            message: other.to_string(),
        },
    }
}

/// Per-operation verdicts of a partial append.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchVerdict {
    /// Stored or already known, in input order.
    pub accepted: Vec<OpId>,
    /// Refused, in input order.
    pub rejected: Vec<RejectedOp>,
}

/// The append-only operation ledger.
pub struct OpLogStore {
    journal: Journal,
    ops: BTreeMap<u64, LocalOperation>,
    by_id: HashMap<OpId, u64>,
    by_entity: HashMap<EntityKey, BTreeSet<u64>>,
    by_type: HashMap<EntityType, BTreeSet<u64>>,
    unpushed: BTreeMap<OpId, u64>,
    chains: ChainIndex,
    cursors: HashMap<EntityType, SyncCursor>,
    resolutions: HashMap<ConflictId, Resolution>,
    baselines: HashMap<EntityKey, Baseline>,
    last_sync_time: Option<i64>,
    next_position: u64,
}

impl OpLogStore {
    /// Opens the store, replaying its journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is unreadable or corrupt.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let (journal, records) = Journal::open(backend)?;
        let mut store = Self {
            journal,
            ops: BTreeMap::new(),
            by_id: HashMap::new(),
            by_entity: HashMap::new(),
            by_type: HashMap::new(),
            unpushed: BTreeMap::new(),
            chains: ChainIndex::default(),
            cursors: HashMap::new(),
            resolutions: HashMap::new(),
            baselines: HashMap::new(),
            last_sync_time: None,
            next_position: 1,
        };
        let count = records.len();
        for record in records {
            store.apply(record);
        }
        info!(
            records = count,
            operations = store.ops.len(),
            unpushed = store.unpushed.len(),
            "op-log opened"
        );
        Ok(store)
    }

    fn insert(&mut self, op: Operation, pushed: bool) {
        if self.chains.known.contains_key(&op.op_id) {
            return;
        }
        let position = self.next_position;
        self.next_position += 1;
        self.chains.record(&op);
        self.by_id.insert(op.op_id, position);
        self.by_entity
            .entry(EntityKey::of(&op))
            .or_default()
            .insert(position);
        self.by_type
            .entry(op.entity_type)
            .or_default()
            .insert(position);
        if !pushed {
            self.unpushed.insert(op.op_id, position);
        }
        self.ops.insert(
            position,
            LocalOperation {
                op,
                pushed,
                position,
            },
        );
    }

    fn remove(&mut self, op_id: &OpId) {
        let Some(position) = self.by_id.remove(op_id) else {
            return;
        };
        if let Some(local) = self.ops.remove(&position) {
            let key = EntityKey::of(&local.op);
            if let Some(set) = self.by_entity.get_mut(&key) {
                set.remove(&position);
                if set.is_empty() {
                    self.by_entity.remove(&key);
                }
            }
            if let Some(set) = self.by_type.get_mut(&local.op.entity_type) {
                set.remove(&position);
            }
            self.unpushed.remove(op_id);
        }
    }

    /// Applies a journal record to the indexes.
    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Append { op } => self.insert(op, false),
            JournalRecord::RemoteBatch { ops, cursor } => {
                for op in ops {
                    self.insert(op, true);
                }
                if let Some((entity_type, cursor)) = cursor {
                    self.cursors.insert(entity_type, cursor);
                }
            }
            JournalRecord::MarkPushed { op_ids } => {
                for id in op_ids {
                    if let Some(position) = self.unpushed.remove(&id) {
                        if let Some(local) = self.ops.get_mut(&position) {
                            local.pushed = true;
                        }
                    }
                }
            }
            JournalRecord::Pruned { op_ids, baselines } => {
                for id in &op_ids {
                    self.remove(id);
                }
                for baseline in baselines {
                    let key = EntityKey::new(baseline.entity.entity_type, baseline.entity.entity_id.clone());
                    self.baselines.insert(key, baseline);
                }
            }
            JournalRecord::CursorSet {
                entity_type,
                cursor,
            } => {
                self.cursors.insert(entity_type, cursor);
            }
            JournalRecord::CursorsReset => self.cursors.clear(),
            JournalRecord::ConflictResolved {
                conflict_id,
                resolution,
            } => {
                self.resolutions.insert(conflict_id, resolution);
            }
            JournalRecord::SyncRecorded { at } => self.last_sync_time = Some(at),
        }
    }

    fn commit(&mut self, record: JournalRecord) -> CoreResult<()> {
        self.journal.append(&record)?;
        self.apply(record);
        Ok(())
    }

    /// Appends one locally recorded operation under the continuity check.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ChainIntegrityViolation`] if the operation does
    /// not extend its device's chain, or
    /// [`CoreError::CausalOrderingViolation`] if its clock does not advance.
    pub fn append(&mut self, op: Operation) -> CoreResult<AppendOutcome> {
        let outcome = Staging::new(&self.chains).admit(&op, ChainCheck::Continuity)?;
        if outcome == AppendOutcome::Appended {
            debug!(op_id = %op.op_id, device = %op.device_id, clock = op.logical_clock, "appended");
            self.commit(JournalRecord::Append { op })?;
        }
        Ok(outcome)
    }

    /// Appends a batch of received operations all-or-nothing, optionally
    /// advancing one cursor in the same journal record.
    ///
    /// `check` picks the chain check for each operation's device.
    ///
    /// # Errors
    ///
    /// The first failing operation's error; nothing is written.
    pub fn append_batch<F>(
        &mut self,
        ops: &[Operation],
        check: F,
        cursor: Option<(EntityType, SyncCursor)>,
    ) -> CoreResult<Vec<AppendOutcome>>
    where
        F: Fn(&DeviceId) -> ChainCheck,
    {
        let mut staging = Staging::new(&self.chains);
        let mut outcomes = Vec::with_capacity(ops.len());
        let mut fresh = Vec::new();
        for op in ops {
            let outcome = staging.admit(op, check(&op.device_id))?;
            if outcome == AppendOutcome::Appended {
                fresh.push(op.clone());
            }
            outcomes.push(outcome);
        }

        let cursor_changes = cursor.is_some_and(|(t, c)| self.cursor(t) != c);
        if fresh.is_empty() && !cursor_changes {
            return Ok(outcomes);
        }
        debug!(new = fresh.len(), total = ops.len(), "remote batch appended");
        self.commit(JournalRecord::RemoteBatch { ops: fresh, cursor })?;
        Ok(outcomes)
    }

    /// Appends what it can from a pushed batch, under continuity for every
    /// device.
    ///
    /// Each device's operations are validated in chain order. Once one is
    /// refused, every later operation of that device is refused too.
    /// Accepted operations are written in one journal record.
    ///
    /// # Errors
    ///
    /// Only storage failures are errors; validation failures are verdicts.
    pub fn append_partial(&mut self, ops: &[Operation]) -> CoreResult<BatchVerdict> {
        let mut by_device: BTreeMap<&DeviceId, Vec<&Operation>> = BTreeMap::new();
        for op in ops {
            by_device.entry(&op.device_id).or_default().push(op);
        }

        let mut staging = Staging::new(&self.chains);
        let mut fresh = Vec::new();
        let mut verdicts: HashMap<OpId, Result<(), RejectReason>> = HashMap::new();
        for (device, mut chain) in by_device {
            chain.sort_by_key(|op| (op.logical_clock, op.op_id));
            let mut broken: Option<OpId> = None;
            for op in chain {
                if let Some(first_rejected) = broken {
                    verdicts.insert(op.op_id, Err(RejectReason::AfterBrokenLink { first_rejected }));
                    continue;
                }
                match staging.admit(op, ChainCheck::Continuity) {
                    Ok(AppendOutcome::Appended) => {
                        fresh.push(op.clone());
                        verdicts.insert(op.op_id, Ok(()));
                    }
                    Ok(AppendOutcome::Duplicate) => {
                        verdicts.insert(op.op_id, Ok(()));
                    }
                    Err(e) => {
                        warn!(device = %device, op_id = %op.op_id, error = %e, "push rejected");
                        broken = Some(op.op_id);
                        verdicts.insert(op.op_id, Err(reject_reason(&e)));
                    }
                }
            }
        }

        if !fresh.is_empty() {
            self.commit(JournalRecord::RemoteBatch {
                ops: fresh,
                cursor: None,
            })?;
        }

        let mut verdict = BatchVerdict::default();
        for op in ops {
            match verdicts.remove(&op.op_id) {
                Some(Ok(())) => verdict.accepted.push(op.op_id),
                Some(Err(reason)) => verdict.rejected.push(RejectedOp {
                    op_id: op.op_id,
                    reason,
                }),
                // Repeated op_id within the batch: already judged.
                None => {}
            }
        }
        Ok(verdict)
    }

    /// Returns true if the operation is stored.
    #[must_use]
    pub fn contains(&self, op_id: &OpId) -> bool {
        self.by_id.contains_key(op_id)
    }

    /// Returns true if the operation was ever stored, even if it has
    /// since been pruned.
    #[must_use]
    pub fn knows(&self, op_id: &OpId) -> bool {
        self.chains.known.contains_key(op_id)
    }

    /// Looks up a stored operation.
    #[must_use]
    pub fn get(&self, op_id: &OpId) -> Option<&LocalOperation> {
        self.by_id.get(op_id).and_then(|p| self.ops.get(p))
    }

    fn sorted(&self, positions: impl Iterator<Item = u64>) -> Vec<Operation> {
        let mut ops: Vec<Operation> = positions
            .filter_map(|p| self.ops.get(&p))
            .map(|l| l.op.clone())
            .collect();
        ops.sort_by_key(Operation::causal_key);
        ops
    }

    /// Operations of `entity_type` that arrived after `cursor`, sorted by
    /// causal key.
    #[must_use]
    pub fn operations_since(&self, entity_type: EntityType, cursor: &SyncCursor) -> Vec<Operation> {
        let Some(positions) = self.by_type.get(&entity_type) else {
            return Vec::new();
        };
        let Some(start) = cursor.position.checked_add(1) else {
            return Vec::new();
        };
        self.sorted(positions.range(start..).copied())
    }

    /// Up to `limit` operations of `entity_type` after `cursor` in arrival
    /// order, returned sorted by causal key.
    #[must_use]
    pub fn operations_page(
        &self,
        entity_type: EntityType,
        cursor: &SyncCursor,
        limit: usize,
    ) -> OperationPage {
        let empty = BTreeSet::new();
        let positions = self.by_type.get(&entity_type).unwrap_or(&empty);
        // Nothing can sit past the last position.
        let mut range = match cursor.position.checked_add(1) {
            Some(start) => positions.range(start..),
            None => empty.range(..),
        }
        .copied();
        let page: Vec<u64> = range.by_ref().take(limit).collect();
        let has_more = range.next().is_some();

        let next_cursor = page
            .last()
            .and_then(|p| self.ops.get(p))
            .map_or(*cursor, |last| SyncCursor {
                last_op_id: Some(last.op.op_id),
                last_timestamp: last.op.client_timestamp,
                position: last.position,
            });

        OperationPage {
            ops: self.sorted(page.into_iter()),
            next_cursor,
            has_more,
        }
    }

    /// Operations of one entity, sorted by causal key.
    #[must_use]
    pub fn entity_ops(&self, key: &EntityKey) -> Vec<Operation> {
        match self.by_entity.get(key) {
            Some(positions) => self.sorted(positions.iter().copied()),
            None => Vec::new(),
        }
    }

    /// Stored operations of one entity with their bookkeeping, sorted by
    /// causal key.
    #[must_use]
    pub fn entity_records(&self, key: &EntityKey) -> Vec<&LocalOperation> {
        let mut records: Vec<&LocalOperation> = self
            .by_entity
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|p| self.ops.get(p))
            .collect();
        records.sort_by_key(|l| l.op.causal_key());
        records
    }

    /// Every entity of `entity_type` with operations or a baseline, sorted.
    #[must_use]
    pub fn entity_ids(&self, entity_type: EntityType) -> Vec<EntityId> {
        let mut ids: BTreeSet<EntityId> = self
            .by_entity
            .keys()
            .filter(|k| k.entity_type == entity_type)
            .map(|k| k.entity_id.clone())
            .collect();
        ids.extend(
            self.baselines
                .keys()
                .filter(|k| k.entity_type == entity_type)
                .map(|k| k.entity_id.clone()),
        );
        ids.into_iter().collect()
    }

    /// Every entity with operations or a baseline.
    #[must_use]
    pub fn entity_keys(&self) -> Vec<EntityKey> {
        let mut keys: BTreeSet<EntityKey> = self.by_entity.keys().cloned().collect();
        keys.extend(self.baselines.keys().cloned());
        keys.into_iter().collect()
    }

    /// Up to `limit` unpushed operations in `op_id` order.
    #[must_use]
    pub fn unpushed(&self, limit: usize) -> Vec<Operation> {
        self.unpushed
            .values()
            .filter_map(|p| self.ops.get(p))
            .take(limit)
            .map(|l| l.op.clone())
            .collect()
    }

    /// Number of unpushed operations.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.unpushed.len()
    }

    /// Flags operations as acknowledged. Unknown or already pushed ids are
    /// ignored. Returns how many changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn mark_pushed(&mut self, op_ids: &[OpId]) -> CoreResult<usize> {
        let mut changed: Vec<OpId> = op_ids
            .iter()
            .filter(|id| self.unpushed.contains_key(id))
            .copied()
            .collect();
        changed.sort();
        changed.dedup();
        if changed.is_empty() {
            return Ok(0);
        }
        let count = changed.len();
        self.commit(JournalRecord::MarkPushed { op_ids: changed })?;
        debug!(count, "operations marked pushed");
        Ok(count)
    }

    /// The cursor for `entity_type`; the start cursor if none is stored.
    #[must_use]
    pub fn cursor(&self, entity_type: EntityType) -> SyncCursor {
        self.cursors.get(&entity_type).copied().unwrap_or_default()
    }

    /// Advances the cursor for `entity_type`.
    ///
    /// # Errors
    ///
    /// Moving a cursor backwards is an invalid operation; only
    /// [`reset_cursors`](Self::reset_cursors) may do that.
    pub fn set_cursor(&mut self, entity_type: EntityType, cursor: SyncCursor) -> CoreResult<()> {
        let current = self.cursor(entity_type);
        if !cursor.has_reached(&current) {
            return Err(CoreError::invalid_operation(format!(
                "cursor for {entity_type} would move back from {} to {}",
                current.position, cursor.position
            )));
        }
        if current == cursor {
            return Ok(());
        }
        self.commit(JournalRecord::CursorSet {
            entity_type,
            cursor,
        })
    }

    /// Resets every cursor to the start.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn reset_cursors(&mut self) -> CoreResult<()> {
        warn!("resetting all sync cursors");
        self.commit(JournalRecord::CursorsReset)
    }

    /// Recorded conflict resolutions.
    #[must_use]
    pub fn resolutions(&self) -> &HashMap<ConflictId, Resolution> {
        &self.resolutions
    }

    /// Journals a conflict resolution.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn record_resolution(
        &mut self,
        conflict_id: ConflictId,
        resolution: Resolution,
    ) -> CoreResult<()> {
        self.commit(JournalRecord::ConflictResolved {
            conflict_id,
            resolution,
        })
    }

    /// Pruned baseline of an entity.
    #[must_use]
    pub fn baseline(&self, key: &EntityKey) -> Option<&Baseline> {
        self.baselines.get(key)
    }

    /// Removes pushed operations and installs the baselines they were
    /// folded into.
    ///
    /// # Errors
    ///
    /// Refuses to remove an unpushed operation. Returns an error if the
    /// journal write fails.
    pub fn apply_prune(&mut self, op_ids: Vec<OpId>, baselines: Vec<Baseline>) -> CoreResult<()> {
        if let Some(id) = op_ids.iter().find(|id| self.unpushed.contains_key(id)) {
            return Err(CoreError::invalid_operation(format!(
                "cannot prune unpushed operation {id}"
            )));
        }
        if op_ids.is_empty() {
            return Ok(());
        }
        info!(operations = op_ids.len(), entities = baselines.len(), "pruning op-log");
        self.commit(JournalRecord::Pruned { op_ids, baselines })
    }

    /// Time of the last completed sync.
    #[must_use]
    pub fn last_sync_time(&self) -> Option<i64> {
        self.last_sync_time
    }

    /// Journals a completed sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn record_sync_time(&mut self, at: i64) -> CoreResult<()> {
        self.commit(JournalRecord::SyncRecorded { at })
    }

    /// Current tip of a device chain.
    #[must_use]
    pub fn tip(&self, device: &DeviceId) -> Option<ChainTip> {
        self.chains.tips.get(device).copied()
    }

    /// Re-verifies every stored device chain.
    ///
    /// Devices checked under continuity must form one unbroken run from
    /// their first retained operation. Linkage devices are checked run by
    /// run, each run being consecutive operations that link to each other.
    ///
    /// # Errors
    ///
    /// Returns the first violation found, devices in sorted order.
    pub fn verify_chains<F>(&self, check: F) -> Result<(), ChainViolation>
    where
        F: Fn(&DeviceId) -> ChainCheck,
    {
        let mut by_device: BTreeMap<&DeviceId, Vec<&Operation>> = BTreeMap::new();
        for local in self.ops.values() {
            by_device.entry(&local.op.device_id).or_default().push(&local.op);
        }

        for (device, mut ops) in by_device {
            ops.sort_by_key(|op| op.causal_key());
            let ops: Vec<Operation> = ops.into_iter().cloned().collect();
            match check(device) {
                ChainCheck::Continuity => shiftsync_protocol::verify_chain(&ops)?,
                ChainCheck::Linkage => {
                    let mut start = 0;
                    for i in 1..=ops.len() {
                        let run_ends = i == ops.len() || ops[i].prev_hash != Some(ops[i - 1].hash);
                        if run_ends {
                            shiftsync_protocol::verify_chain(&ops[start..i])?;
                            start = i;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Counts for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal size cannot be read.
    pub fn stats(&self) -> CoreResult<StoreStats> {
        Ok(StoreStats {
            operations: self.ops.len(),
            unpushed: self.unpushed.len(),
            devices: self.chains.tips.len(),
            entities: self.entity_keys().len(),
            baselines: self.baselines.len(),
            journal_bytes: self.journal.size()?,
        })
    }

    /// Iterates over every stored operation in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &LocalOperation> {
        self.ops.values()
    }
}

impl std::fmt::Debug for OpLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpLogStore")
            .field("operations", &self.ops.len())
            .field("unpushed", &self.unpushed.len())
            .field("devices", &self.chains.tips.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiftsync_protocol::{ActorId, FieldPath, OpKind, OpValue, OperationDraft};
    use shiftsync_storage::InMemoryBackend;

    fn chain(device: &str, entity_type: EntityType, n: u64, id_base: u128) -> Vec<Operation> {
        let mut prev = None;
        (1..=n)
            .map(|clock| {
                let op = OperationDraft {
                    op_id: OpId::from_u128(id_base + u128::from(clock)),
                    device_id: DeviceId::new(device).unwrap(),
                    actor_id: ActorId::new("crew").unwrap(),
                    client_timestamp: 1_000 * clock as i64,
                    logical_clock: clock,
                    entity_type,
                    entity_id: EntityId::new(format!("e{}", clock % 2)).unwrap(),
                    kind: OpKind::Update,
                    path: Some(FieldPath::parse("notes").unwrap()),
                    value: Some(OpValue::Integer(clock as i64)),
                }
                .seal(prev)
                .unwrap();
                prev = Some(op.hash);
                op
            })
            .collect()
    }

    fn store() -> (OpLogStore, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        (OpLogStore::open(Box::new(backend.clone())).unwrap(), backend)
    }

    #[test]
    fn append_requires_continuity() {
        let (mut s, _) = store();
        let ops = chain("a", EntityType::Shift, 3, 0);
        assert_eq!(s.append(ops[0].clone()).unwrap(), AppendOutcome::Appended);
        let err = s.append(ops[2].clone()).unwrap_err();
        assert!(matches!(err, CoreError::ChainIntegrityViolation(_)));
        assert_eq!(s.append(ops[1].clone()).unwrap(), AppendOutcome::Appended);
        assert_eq!(s.append(ops[1].clone()).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(s.pending_count(), 2);
    }

    #[test]
    fn reused_op_id_is_violation() {
        let (mut s, _) = store();
        let ops = chain("a", EntityType::Shift, 1, 0);
        s.append(ops[0].clone()).unwrap();
        let mut other = chain("b", EntityType::Shift, 1, 0).remove(0);
        other.op_id = ops[0].op_id;
        let err = s
            .append_batch(&[other], |_| ChainCheck::Linkage, None)
            .unwrap_err();
        match err {
            CoreError::ChainIntegrityViolation(v) => {
                assert!(matches!(v.kind, ViolationKind::ReusedOpId { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let (mut s, _) = store();
        let mut ops = chain("b", EntityType::Shift, 4, 100);
        ops[2].value = Some(OpValue::text("tampered"));
        let cursor = SyncCursor {
            last_op_id: Some(ops[3].op_id),
            last_timestamp: 4_000,
            position: 4,
        };
        let result = s.append_batch(&ops, |_| ChainCheck::Linkage, Some((EntityType::Shift, cursor)));
        assert!(result.is_err());
        assert!(s.iter().next().is_none());
        assert!(s.cursor(EntityType::Shift).is_start());
    }

    #[test]
    fn linkage_accepts_subsequence_and_refuses_forks() {
        let (mut s, _) = store();
        let ops = chain("b", EntityType::Shift, 5, 100);
        let subsequence = vec![ops[0].clone(), ops[2].clone(), ops[4].clone()];
        s.append_batch(&subsequence, |_| ChainCheck::Linkage, None)
            .unwrap();

        // Another first operation for device b.
        let forked = chain("b", EntityType::Shift, 1, 900).remove(0);
        let err = s
            .append_batch(&[forked], |_| ChainCheck::Linkage, None)
            .unwrap_err();
        assert!(err.is_integrity_violation());
        assert!(s.verify_chains(|_| ChainCheck::Linkage).is_ok());
    }

    #[test]
    fn partial_append_stops_at_broken_link() {
        let (mut s, _) = store();
        let mut ops = chain("a", EntityType::Shift, 10, 0);
        ops[4].prev_hash = Some(ChainHash::from_bytes([7; 32]));
        // Re-seal so the digest is valid and only the link is wrong.
        let draft = OperationDraft {
            op_id: ops[4].op_id,
            device_id: ops[4].device_id.clone(),
            actor_id: ops[4].actor_id.clone(),
            client_timestamp: ops[4].client_timestamp,
            logical_clock: ops[4].logical_clock,
            entity_type: ops[4].entity_type,
            entity_id: ops[4].entity_id.clone(),
            kind: ops[4].kind,
            path: ops[4].path.clone(),
            value: ops[4].value.clone(),
        };
        ops[4] = draft.seal(ops[4].prev_hash).unwrap();

        let verdict = s.append_partial(&ops).unwrap();
        assert_eq!(verdict.accepted, ops[..4].iter().map(|o| o.op_id).collect::<Vec<_>>());
        assert_eq!(verdict.rejected.len(), 6);
        assert!(matches!(verdict.rejected[0].reason, RejectReason::BrokenChain { .. }));
        assert!(verdict.rejected[1..]
            .iter()
            .all(|r| r.reason == RejectReason::AfterBrokenLink { first_rejected: ops[4].op_id }));
        assert_eq!(s.iter().count(), 4);
    }

    #[test]
    fn pages_follow_arrival_order() {
        let (mut s, _) = store();
        let ops = chain("a", EntityType::Shift, 5, 0);
        s.append_batch(&ops, |_| ChainCheck::Continuity, None).unwrap();

        let first = s.operations_page(EntityType::Shift, &SyncCursor::start(), 2);
        assert_eq!(first.ops.len(), 2);
        assert!(first.has_more);
        assert_eq!(first.next_cursor.position, 2);
        let rest = s.operations_page(EntityType::Shift, &first.next_cursor, 10);
        assert_eq!(rest.ops.len(), 3);
        assert!(!rest.has_more);
        assert!(s
            .operations_page(EntityType::Action, &SyncCursor::start(), 10)
            .ops
            .is_empty());
        assert_eq!(s.operations_since(EntityType::Shift, &first.next_cursor).len(), 3);
    }

    #[test]
    fn cursor_at_the_last_position_reads_nothing() {
        let (mut s, _) = store();
        let ops = chain("a", EntityType::Shift, 3, 0);
        s.append_batch(&ops, |_| ChainCheck::Continuity, None).unwrap();
        let end = SyncCursor {
            last_op_id: None,
            last_timestamp: 0,
            position: u64::MAX,
        };
        let page = s.operations_page(EntityType::Shift, &end, 10);
        assert!(page.ops.is_empty());
        assert!(!page.has_more);
        assert_eq!(page.next_cursor, end);
        assert!(s.operations_since(EntityType::Shift, &end).is_empty());
    }

    #[test]
    fn clock_near_the_ceiling_is_refused() {
        let (mut s, _) = store();
        let op = OperationDraft {
            op_id: OpId::from_u128(1),
            device_id: DeviceId::new("b").unwrap(),
            actor_id: ActorId::new("crew").unwrap(),
            client_timestamp: 0,
            logical_clock: u64::MAX,
            entity_type: EntityType::Shift,
            entity_id: EntityId::new("e0").unwrap(),
            kind: OpKind::Update,
            path: Some(FieldPath::parse("notes").unwrap()),
            value: Some(OpValue::Integer(1)),
        }
        .seal(None)
        .unwrap();
        let err = s
            .append_batch(&[op.clone()], |_| ChainCheck::Linkage, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
        assert!(s.iter().next().is_none());

        let verdict = s.append_partial(&[op]).unwrap();
        assert!(verdict.accepted.is_empty());
        assert_eq!(verdict.rejected.len(), 1);
    }

    #[test]
    fn state_survives_reopen() {
        let (mut s, backend) = store();
        let ops = chain("a", EntityType::Shift, 3, 0);
        for op in &ops {
            s.append(op.clone()).unwrap();
        }
        s.mark_pushed(&[ops[0].op_id, ops[0].op_id]).unwrap();
        let cursor = SyncCursor {
            last_op_id: None,
            last_timestamp: 0,
            position: 9,
        };
        s.set_cursor(EntityType::Action, cursor).unwrap();
        s.record_sync_time(77).unwrap();
        drop(s);

        let s = OpLogStore::open(Box::new(backend)).unwrap();
        assert_eq!(s.pending_count(), 2);
        assert_eq!(s.unpushed(10)[0].op_id, ops[1].op_id);
        assert_eq!(s.cursor(EntityType::Action).position, 9);
        assert_eq!(s.last_sync_time(), Some(77));
        assert_eq!(s.tip(&DeviceId::new("a").unwrap()).unwrap().op_id, ops[2].op_id);
    }

    #[test]
    fn cursor_never_moves_back() {
        let (mut s, _) = store();
        let ahead = SyncCursor {
            last_op_id: None,
            last_timestamp: 0,
            position: 5,
        };
        s.set_cursor(EntityType::Shift, ahead).unwrap();
        assert!(s.set_cursor(EntityType::Shift, SyncCursor::start()).is_err());
        s.reset_cursors().unwrap();
        assert!(s.cursor(EntityType::Shift).is_start());
    }

    #[test]
    fn prune_refuses_unpushed() {
        let (mut s, _) = store();
        let ops = chain("a", EntityType::Shift, 2, 0);
        for op in &ops {
            s.append(op.clone()).unwrap();
        }
        assert!(s.apply_prune(vec![ops[0].op_id], Vec::new()).is_err());
        s.mark_pushed(&[ops[0].op_id]).unwrap();
        s.apply_prune(vec![ops[0].op_id], Vec::new()).unwrap();
        assert!(!s.contains(&ops[0].op_id));
        // A pruned operation arriving again is a duplicate, not new.
        let outcome = s
            .append_batch(&ops[..1], |_| ChainCheck::Continuity, None)
            .unwrap();
        assert_eq!(outcome, vec![AppendOutcome::Duplicate]);
        assert!(s.verify_chains(|_| ChainCheck::Continuity).is_ok());
    }
}
