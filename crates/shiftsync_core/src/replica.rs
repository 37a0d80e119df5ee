//! The local replica.
//!
//! `Replica` is the context object application code holds. It owns the
//! causal clock, the op-log store, the merge rules and a cache of
//! projections, and serializes every local write behind one lock so the
//! clock and the device chain advance together.

use crate::clock::CausalClock;
use crate::config::ReplicaConfig;
use crate::error::{CoreError, CoreResult};
use crate::projector::{Entity, EntityFilter, EntityProjector, Projection};
use crate::registry::MergeRuleRegistry;
use crate::scoring::{rank_conflicts, ConflictScore};
use crate::store::{AppendOutcome, ChainCheck, EntityKey, LocalOperation, OpLogStore, StoreStats};
use parking_lot::Mutex;
use serde::Serialize;
use shiftsync_protocol::{
    ConflictId, ConflictRecord, DeviceId, EntityId, EntityType, FieldPath, OpId, OpKind, OpValue,
    Operation, OperationDraft, Resolution, SyncCursor,
};
use shiftsync_storage::{InMemoryBackend, StorageBackend};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Diagnostics for the sync layer and operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Operations waiting to be pushed.
    pub pending_ops: usize,
    /// Wall-clock milliseconds of the last completed sync.
    pub last_sync_time: Option<i64>,
    /// Conflicts waiting for a person.
    pub unresolved_conflict_count: usize,
    /// Why local writes are refused, if they are.
    pub quarantined: Option<String>,
}

/// Result of applying received operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Operations that were new.
    pub appended: usize,
    /// Operations already known.
    pub duplicates: usize,
}

/// Result of a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Operations removed.
    pub pruned_ops: usize,
    /// Entities that got a new baseline.
    pub entities: usize,
}

struct Inner {
    clock: CausalClock,
    store: OpLogStore,
    projections: HashMap<EntityKey, Projection>,
    quarantine: Option<String>,
}

/// A device's local op-log replica.
pub struct Replica {
    config: ReplicaConfig,
    registry: Arc<MergeRuleRegistry>,
    inner: Mutex<Inner>,
    #[cfg(feature = "std")]
    _dir: Option<crate::dir::ReplicaDir>,
}

impl Replica {
    /// Opens, or creates, a replica in a directory.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReplicaLocked`] if another process has the
    /// directory open, [`CoreError::ClockUnavailable`] if the clock state
    /// is damaged, or a journal error.
    #[cfg(feature = "std")]
    pub fn open(
        path: &std::path::Path,
        config: ReplicaConfig,
        registry: Arc<MergeRuleRegistry>,
    ) -> CoreResult<Self> {
        use shiftsync_storage::FileBackend;

        let dir = crate::dir::ReplicaDir::open(path, config.create_if_missing)?;
        let journal = FileBackend::open(&dir.journal_path())?;
        let clock = FileBackend::open(&dir.clock_path())?;
        let mut replica = Self::from_backends(config, registry, Box::new(journal), Box::new(clock))?;
        replica._dir = Some(dir);
        info!(path = %path.display(), "replica opened");
        Ok(replica)
    }

    /// Creates an empty replica held in memory.
    ///
    /// # Errors
    ///
    /// Fails only if an empty backend cannot be read.
    pub fn in_memory(config: ReplicaConfig, registry: Arc<MergeRuleRegistry>) -> CoreResult<Self> {
        Self::from_backends(
            config,
            registry,
            Box::new(InMemoryBackend::new()),
            Box::new(InMemoryBackend::new()),
        )
    }

    /// Opens a replica over explicit journal and clock backends.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open), minus locking.
    pub fn from_backends(
        config: ReplicaConfig,
        registry: Arc<MergeRuleRegistry>,
        journal: Box<dyn StorageBackend>,
        clock: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        let store = OpLogStore::open(journal)?;
        let mut clock = CausalClock::open(clock)?;
        // The log may be ahead of the clock file if a crash hit between
        // the two writes.
        let high_water = store.iter().map(|l| l.op.logical_clock).max().unwrap_or(0);
        clock.observe(high_water)?;
        debug!(device = %config.device_id, clock = clock.current(), "replica state loaded");

        Ok(Self {
            config,
            registry,
            inner: Mutex::new(Inner {
                clock,
                store,
                projections: HashMap::new(),
                quarantine: None,
            }),
            #[cfg(feature = "std")]
            _dir: None,
        })
    }

    /// The replica's configuration.
    #[must_use]
    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// The local device.
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.config.device_id
    }

    /// The merge rules in use.
    #[must_use]
    pub fn registry(&self) -> &MergeRuleRegistry {
        &self.registry
    }

    fn check_for(&self) -> impl Fn(&DeviceId) -> ChainCheck + '_ {
        move |device: &DeviceId| {
            if device == &self.config.device_id {
                ChainCheck::Continuity
            } else {
                ChainCheck::Linkage
            }
        }
    }

    fn quarantine_on(&self, inner: &mut Inner, err: &CoreError) {
        let own_chain = match err {
            CoreError::ChainIntegrityViolation(v) => v.device_id == self.config.device_id,
            CoreError::CausalOrderingViolation { device_id, .. } => {
                device_id == &self.config.device_id
            }
            _ => false,
        };
        if own_chain && inner.quarantine.is_none() {
            error!(device = %self.config.device_id, error = %err, "local chain broken, refusing local writes");
            inner.quarantine = Some(err.to_string());
        }
    }

    /// Records a new local operation. This is the only way operations
    /// enter the log from the application.
    ///
    /// # Errors
    ///
    /// - [`CoreError::DeviceQuarantined`] after an integrity failure
    /// - [`CoreError::InvalidOperation`] if the kind, path and value do
    ///   not fit together
    /// - clock or journal failures; nothing is stored in that case
    pub fn record(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
        kind: OpKind,
        path: Option<FieldPath>,
        value: Option<OpValue>,
    ) -> CoreResult<LocalOperation> {
        self.validate_shape(entity_type, kind, path.as_ref(), value.as_ref())?;

        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.quarantine {
            return Err(CoreError::DeviceQuarantined {
                device_id: self.config.device_id.clone(),
                reason: reason.clone(),
            });
        }

        let logical_clock = inner.clock.next()?;
        let prev_hash = inner.store.tip(&self.config.device_id).map(|t| t.hash);
        let op = OperationDraft {
            op_id: OpId::generate(),
            device_id: self.config.device_id.clone(),
            actor_id: self.config.actor_id.clone(),
            client_timestamp: self.config.wall_clock.now_ms(),
            logical_clock,
            entity_type,
            entity_id,
            kind,
            path,
            value,
        }
        .seal(prev_hash)?;

        let op_id = op.op_id;
        let key = EntityKey::of(&op);
        if let Err(e) = inner.store.append(op) {
            self.quarantine_on(&mut inner, &e);
            return Err(e);
        }
        inner.projections.remove(&key);

        inner
            .store
            .get(&op_id)
            .cloned()
            .ok_or_else(|| CoreError::invalid_operation(format!("{op_id} vanished after append")))
    }

    fn validate_shape(
        &self,
        entity_type: EntityType,
        kind: OpKind,
        path: Option<&FieldPath>,
        value: Option<&OpValue>,
    ) -> CoreResult<()> {
        match kind {
            OpKind::Create => {
                if path.is_some() {
                    return Err(CoreError::invalid_operation("create takes no path"));
                }
                if !matches!(value, None | Some(OpValue::Record(_))) {
                    return Err(CoreError::invalid_operation("create value must be a record"));
                }
            }
            OpKind::Update | OpKind::Append | OpKind::Transition => {
                if path.is_none() {
                    return Err(CoreError::invalid_operation(format!("{kind} needs a path")));
                }
                if kind == OpKind::Transition && !matches!(value, Some(OpValue::Text(_))) {
                    return Err(CoreError::invalid_operation("transition value must be a state name"));
                }
            }
            OpKind::Signoff => {
                if path.is_some() || value.is_some() {
                    return Err(CoreError::invalid_operation("signoff takes no path or value"));
                }
                if self.registry.lifecycle(entity_type).is_none() {
                    return Err(CoreError::invalid_operation(format!(
                        "{entity_type} has no sign-off lifecycle"
                    )));
                }
            }
        }
        Ok(())
    }

    fn projector<'a>(&'a self, inner: &'a Inner) -> EntityProjector<'a> {
        EntityProjector::new(
            &self.registry,
            inner.store.resolutions(),
            self.config.window_ms(),
        )
    }

    fn projection<'a>(&self, inner: &'a mut Inner, key: &EntityKey) -> CoreResult<&'a Projection> {
        if !inner.projections.contains_key(key) {
            let ops = inner.store.entity_ops(key);
            let projection = self.projector(inner).project(
                key.entity_type,
                &key.entity_id,
                inner.store.baseline(key),
                &ops,
            )?;
            inner.projections.insert(key.clone(), projection);
        }
        inner
            .projections
            .get(key)
            .ok_or_else(|| CoreError::invalid_operation("projection cache miss"))
    }

    /// Current state of one entity.
    ///
    /// # Errors
    ///
    /// [`CoreError::EntityNotFound`] if no operation touches it.
    pub fn get_entity(&self, entity_type: EntityType, entity_id: &EntityId) -> CoreResult<Entity> {
        let key = EntityKey::new(entity_type, entity_id.clone());
        let mut inner = self.inner.lock();
        let projection = self.projection(&mut inner, &key)?;
        if projection.entity.version == 0 {
            return Err(CoreError::EntityNotFound {
                entity_type,
                entity_id: entity_id.clone(),
            });
        }
        Ok(projection.entity.clone())
    }

    /// Every entity of a type that passes `filter`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if an entity cannot be materialized.
    pub fn list_entities(
        &self,
        entity_type: EntityType,
        filter: &EntityFilter,
    ) -> CoreResult<Vec<Entity>> {
        let mut inner = self.inner.lock();
        let ids = inner.store.entity_ids(entity_type);
        let mut out = Vec::new();
        for id in ids {
            let key = EntityKey::new(entity_type, id);
            let projection = self.projection(&mut inner, &key)?;
            if filter.matches(&projection.entity) {
                out.push(projection.entity.clone());
            }
        }
        Ok(out)
    }

    /// Up to `limit` unpushed operations in `op_id` order.
    #[must_use]
    pub fn pending_push(&self, limit: usize) -> Vec<Operation> {
        self.inner.lock().store.unpushed(limit)
    }

    /// Flags operations as acknowledged by the authority.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn mark_pushed(&self, op_ids: &[OpId]) -> CoreResult<usize> {
        self.inner.lock().store.mark_pushed(op_ids)
    }

    /// Pull cursor for an entity type.
    #[must_use]
    pub fn cursor(&self, entity_type: EntityType) -> SyncCursor {
        self.inner.lock().store.cursor(entity_type)
    }

    /// Applies a pulled page and advances the cursor, all or nothing.
    ///
    /// Every touched entity is materialized with the new operations before
    /// anything is written; if that fails, or any operation fails its chain
    /// check, the store and cursor are left exactly as they were.
    ///
    /// # Errors
    ///
    /// Chain, ordering and journal errors. A violation on this device's own
    /// chain also quarantines the replica.
    pub fn apply_pull(
        &self,
        entity_type: EntityType,
        ops: &[Operation],
        next_cursor: SyncCursor,
    ) -> CoreResult<ApplyReport> {
        if let Some(op) = ops.iter().find(|op| op.entity_type != entity_type) {
            return Err(CoreError::invalid_operation(format!(
                "pulled {} operation {} in a {entity_type} page",
                op.entity_type, op.op_id
            )));
        }
        let report = self.apply(ops, Some((entity_type, next_cursor)))?;
        debug!(
            %entity_type,
            appended = report.appended,
            duplicates = report.duplicates,
            position = next_cursor.position,
            "pull page applied"
        );
        Ok(report)
    }

    /// Applies operations received outside a pull, all or nothing.
    ///
    /// # Errors
    ///
    /// Same as [`apply_pull`](Self::apply_pull).
    pub fn apply_remote(&self, ops: &[Operation]) -> CoreResult<ApplyReport> {
        self.apply(ops, None)
    }

    fn apply(
        &self,
        ops: &[Operation],
        cursor: Option<(EntityType, SyncCursor)>,
    ) -> CoreResult<ApplyReport> {
        let mut inner = self.inner.lock();

        // Dry-run materialization of every entity a new operation touches.
        // Known operations, pruned ones included, are already part of the
        // stored state and must not be folded in a second time.
        let fresh: Vec<&Operation> = ops
            .iter()
            .filter(|op| !inner.store.knows(&op.op_id))
            .collect();
        let touched: HashSet<EntityKey> = fresh.iter().map(|op| EntityKey::of(op)).collect();
        let mut staged = Vec::with_capacity(touched.len());
        for key in touched {
            let mut entity_ops = inner.store.entity_ops(&key);
            entity_ops.extend(
                fresh
                    .iter()
                    .filter(|op| EntityKey::of(op) == key)
                    .map(|op| (*op).clone()),
            );
            let projection = self.projector(&inner).project(
                key.entity_type,
                &key.entity_id,
                inner.store.baseline(&key),
                &entity_ops,
            )?;
            staged.push((key, projection));
        }

        let check = self.check_for();
        let outcomes = match inner.store.append_batch(ops, check, cursor) {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(error = %e, "received batch refused");
                self.quarantine_on(&mut inner, &e);
                return Err(e);
            }
        };

        let max_clock = ops.iter().map(|op| op.logical_clock).max().unwrap_or(0);
        inner.clock.observe(max_clock)?;
        for (key, projection) in staged {
            inner.projections.insert(key, projection);
        }

        let appended = outcomes
            .iter()
            .filter(|o| **o == AppendOutcome::Appended)
            .count();
        Ok(ApplyReport {
            appended,
            duplicates: outcomes.len() - appended,
        })
    }

    fn all_conflicts(&self, inner: &mut Inner) -> CoreResult<Vec<ConflictRecord>> {
        let keys = inner.store.entity_keys();
        let mut out = Vec::new();
        for key in keys {
            out.extend(self.projection(inner, &key)?.conflicts.iter().cloned());
        }
        Ok(out)
    }

    /// Every conflict record, settled ones included.
    ///
    /// # Errors
    ///
    /// Returns an error if an entity cannot be materialized.
    pub fn conflicts(&self) -> CoreResult<Vec<ConflictRecord>> {
        let mut inner = self.inner.lock();
        self.all_conflicts(&mut inner)
    }

    /// Conflicts waiting for a person.
    ///
    /// # Errors
    ///
    /// Returns an error if an entity cannot be materialized.
    pub fn unresolved_conflicts(&self) -> CoreResult<Vec<ConflictRecord>> {
        Ok(self
            .conflicts()?
            .into_iter()
            .filter(ConflictRecord::is_pending)
            .collect())
    }

    /// Unresolved conflicts scored for review, riskiest first.
    ///
    /// # Errors
    ///
    /// Returns an error if an entity cannot be materialized.
    pub fn conflict_scores(&self) -> CoreResult<Vec<ConflictScore>> {
        Ok(rank_conflicts(&self.registry, &self.unresolved_conflicts()?))
    }

    /// Records a person's decision and returns the re-materialized entity.
    ///
    /// # Errors
    ///
    /// [`CoreError::ConflictNotFound`] for an unknown id, and
    /// [`CoreError::InvalidOperation`] for a conflict that needs no
    /// decision or already has one.
    pub fn resolve_conflict(&self, conflict_id: ConflictId, resolution: Resolution) -> CoreResult<Entity> {
        let mut inner = self.inner.lock();
        let record = self
            .all_conflicts(&mut inner)?
            .into_iter()
            .find(|c| c.conflict_id == conflict_id)
            .ok_or(CoreError::ConflictNotFound(conflict_id))?;
        if !record.requires_approval || record.resolved {
            return Err(CoreError::invalid_operation(format!(
                "conflict {conflict_id} is not awaiting a decision"
            )));
        }

        inner.store.record_resolution(conflict_id, resolution)?;
        // A resolution can change values other entities never see, but
        // the cache is keyed per entity and resolutions are rare.
        inner.projections.clear();
        info!(%conflict_id, entity = %record.entity_id, field = %record.field_path, "conflict resolved");

        let key = EntityKey::new(record.entity_type, record.entity_id);
        Ok(self.projection(&mut inner, &key)?.entity.clone())
    }

    /// Diagnostics snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if an entity cannot be materialized.
    pub fn sync_status(&self) -> CoreResult<SyncStatus> {
        let mut inner = self.inner.lock();
        let unresolved = self
            .all_conflicts(&mut inner)?
            .iter()
            .filter(|c| c.is_pending())
            .count();
        Ok(SyncStatus {
            pending_ops: inner.store.pending_count(),
            last_sync_time: inner.store.last_sync_time(),
            unresolved_conflict_count: unresolved,
            quarantined: inner.quarantine.clone(),
        })
    }

    /// Journals the completion of a sync cycle at the current wall time.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn record_sync_time(&self) -> CoreResult<()> {
        let now = self.config.wall_clock.now_ms();
        self.inner.lock().store.record_sync_time(now)
    }

    /// Removes pushed operations older than the retention period.
    ///
    /// For each entity the longest causal prefix whose operations are all
    /// pushed, older than the cutoff and not part of a pending conflict is
    /// folded into the entity's baseline. Materialized state is unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if materialization or the journal write fails.
    pub fn prune_expired(&self, now_ms: i64) -> CoreResult<PruneReport> {
        let cutoff = now_ms.saturating_sub(self.config.retention_ms());
        let mut inner = self.inner.lock();
        let pending: HashSet<OpId> = self
            .all_conflicts(&mut inner)?
            .iter()
            .filter(|c| c.is_pending())
            .flat_map(|c| c.contending.iter().copied())
            .collect();

        let mut pruned = Vec::new();
        let mut baselines = Vec::new();
        for key in inner.store.entity_keys() {
            let prefix: Vec<Operation> = inner
                .store
                .entity_records(&key)
                .into_iter()
                .take_while(|l| {
                    l.pushed && l.op.client_timestamp < cutoff && !pending.contains(&l.op.op_id)
                })
                .map(|l| l.op.clone())
                .collect();
            let Some(last) = prefix.last() else {
                continue;
            };
            let previous = inner.store.baseline(&key);
            let last_key = previous.map_or(last.causal_key(), |b| b.last_key.max(last.causal_key()));
            let projection =
                self.projector(&inner)
                    .project(key.entity_type, &key.entity_id, previous, &prefix)?;
            pruned.extend(prefix.iter().map(|op| op.op_id));
            baselines.push(projection.into_baseline(last_key));
        }

        let report = PruneReport {
            pruned_ops: pruned.len(),
            entities: baselines.len(),
        };
        if report.pruned_ops > 0 {
            inner.store.apply_prune(pruned, baselines)?;
            inner.projections.clear();
        }
        Ok(report)
    }

    /// Re-verifies every stored chain.
    ///
    /// # Errors
    ///
    /// [`CoreError::ChainIntegrityViolation`] for the first broken chain.
    /// A break in this device's own chain quarantines the replica.
    pub fn verify_integrity(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if let Err(violation) = inner.store.verify_chains(self.check_for()) {
            let err = CoreError::ChainIntegrityViolation(violation);
            self.quarantine_on(&mut inner, &err);
            return Err(err);
        }
        Ok(())
    }

    /// Resets every pull cursor so the next sync fetches everything again.
    /// Already known operations are skipped as duplicates.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn full_resync(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        inner.store.reset_cursors()?;
        inner.projections.clear();
        Ok(())
    }

    /// Store counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal size cannot be read.
    pub fn stats(&self) -> CoreResult<StoreStats> {
        self.inner.lock().store.stats()
    }

    /// Current logical clock value.
    #[must_use]
    pub fn logical_clock(&self) -> u64 {
        self.inner.lock().clock.current()
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("device_id", &self.config.device_id)
            .finish_non_exhaustive()
    }
}
