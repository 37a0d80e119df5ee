//! Entity projector.
//!
//! Rebuilds an entity's current state from its operations. The projection
//! is a pure function of the operation set, the pruned baseline and the
//! recorded resolutions, so materializing twice yields identical bytes.

use crate::error::{CoreError, CoreResult};
use crate::registry::MergeRuleRegistry;
use crate::resolver::{ConflictResolver, Contribution, FieldOutcome, FieldRef, FieldWriter};
use serde::{Deserialize, Serialize};
use shiftsync_protocol::value::{assign, lookup};
use shiftsync_protocol::{
    codec, ActorId, CausalKey, ConflictCause, ConflictId, ConflictRecord, EntityId,
    EntityType, FieldPath, MergeStrategy, OpId, OpKind, OpValue, Operation, Record, Resolution,
};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Materialized state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: EntityId,
    /// Current field values.
    pub state: Record,
    /// Whether a create operation has been seen.
    pub created: bool,
    /// Number of operations folded in, including pruned ones.
    pub version: u64,
    /// Causally last operation folded in.
    pub last_op: Option<OpId>,
}

impl Entity {
    fn empty(entity_type: EntityType, entity_id: EntityId) -> Self {
        Self {
            entity_type,
            entity_id,
            state: Record::new(),
            created: false,
            version: 0,
            last_op: None,
        }
    }

    /// Looks up a field.
    #[must_use]
    pub fn get(&self, path: &FieldPath) -> Option<&OpValue> {
        lookup(&self.state, path)
    }

    /// Canonical CBOR encoding of the entity.
    ///
    /// # Errors
    ///
    /// Fails only if encoding fails.
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        Ok(codec::to_cbor(self)?)
    }
}

/// State folded from a pruned causal prefix.
///
/// Besides the values it keeps who wrote each field and which create
/// seeded the entity, so operations older than the prefix that arrive
/// after pruning merge exactly as they would have against the full log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    /// Entity as of the last pruned operation.
    pub entity: Entity,
    /// Causal key of the last pruned operation.
    pub last_key: CausalKey,
    /// Writer of each field folded into the baseline.
    #[serde(default)]
    pub writers: BTreeMap<FieldPath, FieldWriter>,
    /// Key of the create that seeded the state, if one was pruned.
    #[serde(default)]
    pub create_key: Option<CausalKey>,
}

/// An entity together with the conflicts its replay raised.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// Materialized entity.
    pub entity: Entity,
    /// Conflict records, ordered by field and then fold order.
    pub conflicts: Vec<ConflictRecord>,
    /// Current writer of every written field.
    pub writers: BTreeMap<FieldPath, FieldWriter>,
    /// Key of the create that seeded the state.
    pub create_key: Option<CausalKey>,
}

impl Projection {
    /// Freezes the projection as the baseline for later replays.
    /// `last_key` is the key of the last operation it covers.
    #[must_use]
    pub fn into_baseline(self, last_key: CausalKey) -> Baseline {
        Baseline {
            entity: self.entity,
            last_key,
            writers: self.writers,
            create_key: self.create_key,
        }
    }
}

/// Predicate for listing entities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityFilter {
    equals: Vec<(FieldPath, OpValue)>,
    created_only: bool,
}

impl EntityFilter {
    /// Matches every entity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `path` to hold `value`.
    #[must_use]
    pub fn field_equals(mut self, path: FieldPath, value: impl Into<OpValue>) -> Self {
        self.equals.push((path, value.into()));
        self
    }

    /// Skips entities that were never created.
    #[must_use]
    pub fn created_only(mut self) -> Self {
        self.created_only = true;
        self
    }

    /// Returns true if `entity` passes.
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        if self.created_only && !entity.created {
            return false;
        }
        self.equals
            .iter()
            .all(|(path, value)| entity.get(path) == Some(value))
    }
}

struct FieldGroup {
    path: FieldPath,
    outcome: FieldOutcome,
}

/// Replays operations into entities.
#[derive(Debug, Clone, Copy)]
pub struct EntityProjector<'a> {
    registry: &'a MergeRuleRegistry,
    resolutions: &'a HashMap<ConflictId, Resolution>,
    window_ms: i64,
}

impl<'a> EntityProjector<'a> {
    /// Creates a projector.
    pub fn new(
        registry: &'a MergeRuleRegistry,
        resolutions: &'a HashMap<ConflictId, Resolution>,
        window_ms: i64,
    ) -> Self {
        Self {
            registry,
            resolutions,
            window_ms,
        }
    }

    /// Materializes one entity and discards the conflict records.
    ///
    /// # Errors
    ///
    /// See [`project`](Self::project).
    pub fn materialize(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        ops: &[Operation],
    ) -> CoreResult<Entity> {
        Ok(self.project(entity_type, entity_id, None, ops)?.entity)
    }

    /// Replays `ops` on top of `baseline`.
    ///
    /// Operations may arrive in any order and may contain duplicates.
    /// Operations for other entities are ignored.
    ///
    /// # Errors
    ///
    /// A sign-off for an entity type without a lifecycle is an invalid
    /// operation.
    pub fn project(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        baseline: Option<&Baseline>,
        ops: &[Operation],
    ) -> CoreResult<Projection> {
        let mut ordered: Vec<&Operation> = ops
            .iter()
            .filter(|op| op.entity_type == entity_type && &op.entity_id == entity_id)
            .collect();
        ordered.sort_by_key(|op| op.causal_key());
        ordered.dedup_by_key(|op| op.op_id);

        let mut entity = baseline.map_or_else(
            || Entity::empty(entity_type, entity_id.clone()),
            |b| b.entity.clone(),
        );
        let mut writers = baseline.map(|b| b.writers.clone()).unwrap_or_default();
        let mut create_key = baseline.and_then(|b| b.create_key);

        // The causally latest create seeds the base state. Fields folded
        // into a baseline are laid back over it, since their operations
        // would otherwise have been replayed on top of the create.
        let latest_create = ordered.iter().rev().find(|op| op.kind == OpKind::Create);
        if let Some(create) = latest_create {
            if create_key.map_or(true, |k| create.causal_key() > k) {
                let mut state = match &create.value {
                    Some(OpValue::Record(r)) => r.clone(),
                    _ => Record::new(),
                };
                if let Some(b) = baseline {
                    for path in b.writers.keys() {
                        if let Some(v) = lookup(&b.entity.state, path) {
                            assign(&mut state, path, v.clone());
                        }
                    }
                }
                entity.state = state;
                entity.created = true;
                create_key = Some(create.causal_key());
            }
        }

        let mut groups: BTreeMap<FieldPath, Vec<Contribution>> = BTreeMap::new();
        for op in &ordered {
            for (path, value, strategy) in self.contributions(op)? {
                groups.entry(path).or_default().push(Contribution {
                    key: op.causal_key(),
                    device_id: op.device_id.clone(),
                    actor_id: op.actor_id.clone(),
                    strategy,
                    value,
                });
            }
        }

        let resolver = ConflictResolver::new(self.registry, self.resolutions, self.window_ms);
        let mut folded: Vec<FieldGroup> = Vec::with_capacity(groups.len());
        let mut conflicts = Vec::new();
        for (path, contributions) in groups {
            let field = FieldRef {
                entity_type,
                entity_id,
                path: &path,
            };
            let outcome = resolver.fold_field(
                field,
                lookup(&entity.state, &path),
                writers.get(&path),
                &contributions,
            );
            conflicts.extend(outcome.conflicts.iter().cloned());
            if let Some(writer) = &outcome.writer {
                writers.insert(path.clone(), writer.clone());
            }
            folded.push(FieldGroup { path, outcome });
        }

        // Baseline fields no live operation touched still take part in
        // composing overlapping paths, at the position of their writer.
        if let Some(b) = baseline {
            for (path, writer) in &b.writers {
                if folded.iter().any(|g| &g.path == path) {
                    continue;
                }
                let Some(value) = lookup(&entity.state, path) else {
                    continue;
                };
                folded.push(FieldGroup {
                    path: path.clone(),
                    outcome: FieldOutcome {
                        value: value.clone(),
                        applied: Some(writer.key),
                        applied_by: Some((writer.device_id.clone(), writer.actor_id.clone())),
                        writer: Some(writer.clone()),
                        conflicts: Vec::new(),
                    },
                });
            }
        }

        conflicts.extend(self.compose(&mut entity.state, entity_type, entity_id, &folded, &resolver));

        if let Some(last) = ordered.last() {
            if baseline.map_or(true, |b| last.causal_key() > b.last_key) {
                entity.last_op = Some(last.op_id);
            }
        }
        entity.version += ordered.len() as u64;

        Ok(Projection {
            entity,
            conflicts,
            writers,
            create_key,
        })
    }

    /// Splits an operation into per-field contributions.
    fn contributions(&self, op: &Operation) -> CoreResult<Vec<(FieldPath, OpValue, MergeStrategy)>> {
        match op.kind {
            OpKind::Create => Ok(Vec::new()),
            OpKind::Signoff => {
                let lifecycle = self.registry.lifecycle(op.entity_type).ok_or_else(|| {
                    CoreError::invalid_operation(format!(
                        "{} has no sign-off lifecycle",
                        op.entity_type
                    ))
                })?;
                Ok(vec![
                    (
                        lifecycle.status_path.clone(),
                        OpValue::Text(lifecycle.closed_state.clone()),
                        self.registry.lookup(op.entity_type, &lifecycle.status_path),
                    ),
                    (
                        lifecycle.end_time_path.clone(),
                        OpValue::Timestamp(op.client_timestamp),
                        self.registry.lookup(op.entity_type, &lifecycle.end_time_path),
                    ),
                ])
            }
            OpKind::Update | OpKind::Append | OpKind::Transition => {
                let Some(path) = &op.path else {
                    debug!(op_id = %op.op_id, kind = %op.kind, "operation without a path skipped");
                    return Ok(Vec::new());
                };
                let mut strategy = self.registry.lookup(op.entity_type, path);
                if op.kind == OpKind::Append && strategy == MergeStrategy::LastWriteWins {
                    strategy = MergeStrategy::AppendOnly;
                }
                let value = op.value.clone().unwrap_or(OpValue::Null);
                Ok(vec![(path.clone(), value, strategy)])
            }
        }
    }

    /// Writes folded fields into `state`. Groups on overlapping paths are
    /// applied in the causal order of their last applied write, so a later
    /// write to an ancestor replaces earlier nested writes and vice versa.
    fn compose(
        &self,
        state: &mut Record,
        entity_type: EntityType,
        entity_id: &EntityId,
        folded: &[FieldGroup],
        resolver: &ConflictResolver<'_>,
    ) -> Vec<ConflictRecord> {
        let mut applied: Vec<&FieldGroup> = folded
            .iter()
            .filter(|g| g.outcome.applied.is_some())
            .collect();
        applied.sort_by_key(|g| g.outcome.applied);

        let mut records = Vec::new();
        for (i, later) in applied.iter().enumerate() {
            for earlier in &applied[..i] {
                if !earlier.path.overlaps(&later.path) {
                    continue;
                }
                if let Some(record) = overlap_record(entity_type, entity_id, earlier, later, resolver) {
                    records.push(record);
                }
            }
            assign(state, &later.path, later.outcome.value.clone());
        }
        records
    }
}

fn overlap_record(
    entity_type: EntityType,
    entity_id: &EntityId,
    earlier: &FieldGroup,
    later: &FieldGroup,
    resolver: &ConflictResolver<'_>,
) -> Option<ConflictRecord> {
    let (early_key, (early_device, early_actor)) =
        (earlier.outcome.applied?, earlier.outcome.applied_by.clone()?);
    let (late_key, (late_device, late_actor)) =
        (later.outcome.applied?, later.outcome.applied_by.clone()?);
    if !resolver.concurrent(
        (&early_device, early_key.client_timestamp),
        (&late_device, late_key.client_timestamp),
    ) {
        return None;
    }
    let mut participants: Vec<ActorId> = vec![early_actor, late_actor];
    participants.sort();
    participants.dedup();
    Some(ConflictRecord {
        conflict_id: ConflictId::derive(entity_type, entity_id, &later.path, &late_key.op_id),
        entity_type,
        entity_id: entity_id.clone(),
        field_path: later.path.clone(),
        strategy: MergeStrategy::LastWriteWins,
        cause: ConflictCause::OverlappingWrite,
        contending: vec![early_key.op_id, late_key.op_id],
        participants,
        retained_value: Some(earlier.outcome.value.clone()),
        proposed_value: Some(later.outcome.value.clone()),
        resulting_value: Some(later.outcome.value.clone()),
        first_seen: early_key.client_timestamp.min(late_key.client_timestamp),
        last_seen: early_key.client_timestamp.max(late_key.client_timestamp),
        requires_approval: false,
        resolved: true,
        resolution: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiftsync_protocol::{DeviceId, OperationDraft};

    struct Device {
        id: DeviceId,
        actor: ActorId,
        clock: u64,
        tip: Option<shiftsync_protocol::ChainHash>,
        next_id: u128,
    }

    impl Device {
        fn new(name: &str, id_base: u128) -> Self {
            Self {
                id: DeviceId::new(name).unwrap(),
                actor: ActorId::new(format!("{name}-user")).unwrap(),
                clock: 0,
                tip: None,
                next_id: id_base,
            }
        }

        fn op(&mut self, ts: i64, kind: OpKind, path: Option<&str>, value: Option<OpValue>) -> Operation {
            self.clock += 1;
            self.next_id += 1;
            let op = OperationDraft {
                op_id: OpId::from_u128(self.next_id),
                device_id: self.id.clone(),
                actor_id: self.actor.clone(),
                client_timestamp: ts,
                logical_clock: self.clock,
                entity_type: EntityType::Shift,
                entity_id: EntityId::new("shift-1").unwrap(),
                kind,
                path: path.map(|p| FieldPath::parse(p).unwrap()),
                value,
            }
            .seal(self.tip)
            .unwrap();
            self.tip = Some(op.hash);
            op
        }
    }

    fn seed() -> OpValue {
        let mut r = Record::new();
        r.insert("status".into(), OpValue::text("OPEN"));
        OpValue::Record(r)
    }

    fn path(p: &str) -> FieldPath {
        FieldPath::parse(p).unwrap()
    }

    #[test]
    fn create_then_updates() {
        let registry = MergeRuleRegistry::standard().unwrap();
        let resolutions = HashMap::new();
        let projector = EntityProjector::new(&registry, &resolutions, 300_000);
        let mut a = Device::new("a", 0);
        let ops = vec![
            a.op(1_000, OpKind::Create, None, Some(seed())),
            a.op(2_000, OpKind::Transition, Some("status"), Some(OpValue::text("IN_PROGRESS"))),
            a.op(3_000, OpKind::Update, Some("production.tonnes.mined"), Some(OpValue::Integer(100))),
            a.op(4_000, OpKind::Append, Some("production.delays"), Some(OpValue::text("crusher jam"))),
        ];
        let id = EntityId::new("shift-1").unwrap();
        let entity = projector.materialize(EntityType::Shift, &id, &ops).unwrap();
        assert!(entity.created);
        assert_eq!(entity.version, 4);
        assert_eq!(entity.get(&path("status")), Some(&OpValue::text("IN_PROGRESS")));
        assert_eq!(entity.get(&path("production.tonnes.mined")), Some(&OpValue::Integer(100)));
        assert_eq!(entity.get(&path("production.delays")), Some(&OpValue::text("crusher jam")));
        assert_eq!(entity.last_op, Some(ops[3].op_id));
    }

    #[test]
    fn signoff_closes_and_stamps() {
        let registry = MergeRuleRegistry::standard().unwrap();
        let resolutions = HashMap::new();
        let projector = EntityProjector::new(&registry, &resolutions, 300_000);
        let mut a = Device::new("a", 0);
        let ops = vec![
            a.op(1_000, OpKind::Create, None, Some(seed())),
            a.op(2_000, OpKind::Transition, Some("status"), Some(OpValue::text("IN_PROGRESS"))),
            a.op(9_000, OpKind::Signoff, None, None),
        ];
        let id = EntityId::new("shift-1").unwrap();
        let entity = projector.materialize(EntityType::Shift, &id, &ops).unwrap();
        assert_eq!(entity.get(&path("status")), Some(&OpValue::text("CLOSED")));
        assert_eq!(entity.get(&path("endTime")), Some(&OpValue::Timestamp(9_000)));
    }

    #[test]
    fn closed_shift_cannot_reopen() {
        let registry = MergeRuleRegistry::standard().unwrap();
        let resolutions = HashMap::new();
        let projector = EntityProjector::new(&registry, &resolutions, 300_000);
        let mut a = Device::new("a", 0);
        let mut b = Device::new("b", 1_000);
        b.clock = 5;
        let ops = vec![
            a.op(1_000, OpKind::Create, None, Some(seed())),
            a.op(2_000, OpKind::Transition, Some("status"), Some(OpValue::text("IN_PROGRESS"))),
            a.op(3_000, OpKind::Signoff, None, None),
            b.op(3_500, OpKind::Transition, Some("status"), Some(OpValue::text("OPEN"))),
            b.op(3_600, OpKind::Transition, Some("status"), Some(OpValue::text("OPEN"))),
        ];
        let id = EntityId::new("shift-1").unwrap();
        let projection = projector.project(EntityType::Shift, &id, None, &ops).unwrap();
        assert_eq!(projection.entity.get(&path("status")), Some(&OpValue::text("CLOSED")));
        let pending: Vec<_> = projection.conflicts.iter().filter(|c| c.is_pending()).collect();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|c| c.cause == ConflictCause::MonotonicRejected));
    }

    #[test]
    fn replay_order_does_not_matter() {
        let registry = MergeRuleRegistry::standard().unwrap();
        let resolutions = HashMap::new();
        let projector = EntityProjector::new(&registry, &resolutions, 300_000);
        let mut a = Device::new("a", 0);
        let mut b = Device::new("b", 1_000);
        let mut ops = vec![
            a.op(1_000, OpKind::Create, None, Some(seed())),
            a.op(2_000, OpKind::Append, Some("safety.hazards"), Some(OpValue::text("loose rock"))),
            b.op(2_100, OpKind::Append, Some("safety.hazards"), Some(OpValue::text("dust"))),
            b.op(2_200, OpKind::Update, Some("supervisor"), Some(OpValue::text("bob"))),
            a.op(2_300, OpKind::Update, Some("supervisor"), Some(OpValue::text("ann"))),
        ];
        let id = EntityId::new("shift-1").unwrap();
        let forward = projector.materialize(EntityType::Shift, &id, &ops).unwrap();
        ops.reverse();
        let backward = projector.materialize(EntityType::Shift, &id, &ops).unwrap();
        assert_eq!(forward.to_bytes().unwrap(), backward.to_bytes().unwrap());
    }

    #[test]
    fn later_ancestor_write_replaces_nested_field() {
        let registry = MergeRuleRegistry::empty();
        let resolutions = HashMap::new();
        let projector = EntityProjector::new(&registry, &resolutions, 300_000);
        let mut a = Device::new("a", 0);
        let mut b = Device::new("b", 1_000);
        let mut crew = Record::new();
        crew.insert("lead".into(), OpValue::text("cy"));
        let ops = vec![
            a.op(1_000, OpKind::Update, Some("crew.lead"), Some(OpValue::text("ann"))),
            b.op(1_100, OpKind::Update, Some("crew"), Some(OpValue::Record(crew))),
            b.op(1_200, OpKind::Update, Some("crew.size"), Some(OpValue::Integer(4))),
        ];
        let id = EntityId::new("shift-1").unwrap();
        let projection = projector.project(EntityType::Shift, &id, None, &ops).unwrap();
        let entity = projection.entity;
        assert_eq!(entity.get(&path("crew.lead")), Some(&OpValue::text("cy")));
        assert_eq!(entity.get(&path("crew.size")), Some(&OpValue::Integer(4)));
        assert!(projection
            .conflicts
            .iter()
            .any(|c| c.cause == ConflictCause::OverlappingWrite && !c.requires_approval));
    }

    #[test]
    fn signoff_without_lifecycle_is_invalid() {
        let registry = MergeRuleRegistry::empty();
        let resolutions = HashMap::new();
        let projector = EntityProjector::new(&registry, &resolutions, 300_000);
        let mut a = Device::new("a", 0);
        let ops = vec![a.op(1_000, OpKind::Signoff, None, None)];
        let id = EntityId::new("shift-1").unwrap();
        assert!(projector.materialize(EntityType::Shift, &id, &ops).is_err());
    }

    #[test]
    fn filter_matches_fields() {
        let mut state = Record::new();
        state.insert("status".into(), OpValue::text("OPEN"));
        let entity = Entity {
            entity_type: EntityType::Shift,
            entity_id: EntityId::new("s").unwrap(),
            state,
            created: true,
            version: 1,
            last_op: None,
        };
        assert!(EntityFilter::new().matches(&entity));
        assert!(EntityFilter::new()
            .field_equals(path("status"), "OPEN")
            .created_only()
            .matches(&entity));
        assert!(!EntityFilter::new().field_equals(path("status"), "CLOSED").matches(&entity));
    }
}
