//! Behavioral properties of the replica, checked end to end.

use proptest::prelude::*;
use shiftsync_core::{
    ChainCheck, EntityProjector, ManualWallClock, MergeRuleRegistry, OpLogStore, Replica,
    ReplicaConfig,
};
use shiftsync_protocol::{
    verify_chain, ActorId, ChainHash, ConflictCause, DeviceId, EntityId, EntityType, FieldPath,
    OpId, OpKind, OpValue, Operation, OperationDraft, Record,
};
use shiftsync_storage::InMemoryBackend;
use std::collections::HashMap;
use std::sync::Arc;

struct Device {
    id: DeviceId,
    actor: ActorId,
    clock: u64,
    tip: Option<ChainHash>,
    seq: u128,
}

impl Device {
    fn new(name: &str, seq: u128) -> Self {
        Self {
            id: DeviceId::new(name).unwrap(),
            actor: ActorId::new(format!("{name}-crew")).unwrap(),
            clock: 0,
            tip: None,
            seq,
        }
    }

    fn op(&mut self, ts: i64, kind: OpKind, path: Option<&str>, value: Option<OpValue>) -> Operation {
        self.clock += 1;
        self.seq += 1;
        let op = OperationDraft {
            op_id: OpId::from_u128(self.seq),
            device_id: self.id.clone(),
            actor_id: self.actor.clone(),
            client_timestamp: ts,
            logical_clock: self.clock,
            entity_type: EntityType::Shift,
            entity_id: EntityId::new("shift-7").unwrap(),
            kind,
            path: path.map(|p| FieldPath::parse(p).unwrap()),
            value,
        }
        .seal(self.tip)
        .unwrap();
        self.tip = Some(op.hash);
        op
    }

    /// Catches the logical clock up with another device, as a sync would.
    fn after(&mut self, other: &Device) -> &mut Self {
        self.clock = self.clock.max(other.clock);
        self
    }
}

fn seed() -> Option<OpValue> {
    let mut r = Record::new();
    r.insert("status".into(), OpValue::text("OPEN"));
    Some(OpValue::Record(r))
}

fn field(p: &str) -> FieldPath {
    FieldPath::parse(p).unwrap()
}

/// A fixed two-device history touching every strategy of the standard set.
fn history() -> Vec<Operation> {
    let mut a = Device::new("tablet-a", 0);
    let mut b = Device::new("tablet-b", 1_000);
    vec![
        a.op(1_000, OpKind::Create, None, seed()),
        a.op(1_100, OpKind::Transition, Some("status"), Some("IN_PROGRESS".into())),
        a.op(1_200, OpKind::Update, Some("production.tonnes.mined"), Some(OpValue::Integer(100))),
        b.after(&a).op(1_250, OpKind::Update, Some("production.tonnes.mined"), Some(OpValue::Integer(120))),
        a.op(1_300, OpKind::Append, Some("safety.hazards"), Some(OpValue::List(vec!["a".into(), "b".into()]))),
        b.after(&a).op(1_350, OpKind::Append, Some("safety.hazards"), Some(OpValue::List(vec!["b".into(), "c".into()]))),
        a.op(1_400, OpKind::Append, Some("production.delays"), Some("crusher".into())),
        b.after(&a).op(1_450, OpKind::Append, Some("production.delays"), Some("haul road".into())),
        b.op(1_500, OpKind::Update, Some("supervisor"), Some("bob".into())),
        a.op(1_500, OpKind::Update, Some("supervisor"), Some("ann".into())),
        a.op(1_600, OpKind::Signoff, None, None),
        b.after(&a).op(1_700, OpKind::Transition, Some("status"), Some("OPEN".into())),
    ]
}

fn materialize(ops: &[Operation]) -> Vec<u8> {
    let registry = MergeRuleRegistry::standard().unwrap();
    let resolutions = HashMap::new();
    EntityProjector::new(&registry, &resolutions, 300_000)
        .materialize(EntityType::Shift, &EntityId::new("shift-7").unwrap(), ops)
        .unwrap()
        .to_bytes()
        .unwrap()
}

proptest! {
    #[test]
    fn replay_is_order_insensitive(seed in any::<u64>()) {
        let ops = history();
        let expected = materialize(&ops);

        // Fisher-Yates driven by the seed.
        let mut shuffled = ops.clone();
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let j = (state % (i as u64 + 1)) as usize;
            shuffled.swap(i, j);
        }
        prop_assert_eq!(materialize(&shuffled), expected);
    }

    #[test]
    fn any_field_edit_breaks_the_chain(target in 0usize..12, edit in 0u8..4) {
        let mut a = Device::new("tablet-a", 0);
        let mut ops: Vec<Operation> = (0..12)
            .map(|i| a.op(1_000 + i, OpKind::Update, Some("notes"), Some(OpValue::Integer(i))))
            .collect();
        prop_assert!(verify_chain(&ops).is_ok());

        let op = &mut ops[target];
        match edit {
            0 => op.client_timestamp += 1,
            1 => op.logical_clock += 100,
            2 => op.value = Some(OpValue::text("edited")),
            _ => op.actor_id = ActorId::new("intruder").unwrap(),
        }
        let violation = verify_chain(&ops).unwrap_err();
        prop_assert_eq!(violation.index, target);
        prop_assert_eq!(violation.rejected.len(), 12 - target);
    }
}

#[test]
fn merged_history_has_expected_values() {
    let registry = MergeRuleRegistry::standard().unwrap();
    let resolutions = HashMap::new();
    let projection = EntityProjector::new(&registry, &resolutions, 300_000)
        .project(EntityType::Shift, &EntityId::new("shift-7").unwrap(), None, &history())
        .unwrap();
    let entity = projection.entity;

    assert_eq!(entity.get(&field("production.tonnes.mined")), Some(&OpValue::Integer(120)));
    assert_eq!(
        entity.get(&field("safety.hazards")),
        Some(&OpValue::List(vec!["a".into(), "b".into(), "c".into()]))
    );
    assert_eq!(
        entity.get(&field("production.delays")),
        Some(&OpValue::text("crusher\nhaul road"))
    );
    assert_eq!(entity.get(&field("status")), Some(&OpValue::text("CLOSED")));
    assert_eq!(entity.get(&field("endTime")), Some(&OpValue::Timestamp(1_600)));

    let pending: Vec<_> = projection.conflicts.iter().filter(|c| c.is_pending()).collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].cause, ConflictCause::MonotonicRejected);
    assert_eq!(pending[0].retained_value, Some(OpValue::text("CLOSED")));
}

#[test]
fn equal_clock_tie_goes_to_smaller_op_id() {
    let mut a = Device::new("tablet-a", 50);
    let mut b = Device::new("tablet-b", 10);
    let ops = vec![
        a.op(1_000, OpKind::Update, Some("supervisor"), Some("ann".into())),
        b.op(1_000, OpKind::Update, Some("supervisor"), Some("bob".into())),
    ];
    let registry = MergeRuleRegistry::standard().unwrap();
    let resolutions = HashMap::new();
    let entity = EntityProjector::new(&registry, &resolutions, 300_000)
        .materialize(EntityType::Shift, &EntityId::new("shift-7").unwrap(), &ops)
        .unwrap();
    // b's op id (11) sorts before a's (51).
    assert_eq!(entity.get(&field("supervisor")), Some(&OpValue::text("bob")));
}

#[test]
fn push_of_ten_with_fifth_broken_accepts_four() {
    let mut a = Device::new("tablet-a", 0);
    let mut ops: Vec<Operation> = (0..10)
        .map(|i| a.op(1_000 + i, OpKind::Update, Some("notes"), Some(OpValue::Integer(i))))
        .collect();
    ops[4].prev_hash = Some(ChainHash::from_bytes([9; 32]));

    let mut authority = OpLogStore::open(Box::new(InMemoryBackend::new())).unwrap();
    let verdict = authority.append_partial(&ops).unwrap();
    assert_eq!(verdict.accepted.len(), 4);
    assert_eq!(verdict.rejected.len(), 6);
    let rejected: Vec<OpId> = verdict.rejected.iter().map(|r| r.op_id).collect();
    assert_eq!(rejected, ops[4..].iter().map(|o| o.op_id).collect::<Vec<_>>());
    assert!(authority.verify_chains(|_| ChainCheck::Continuity).is_ok());
}

#[test]
fn failed_pull_leaves_cursor_unchanged() {
    let wall = Arc::new(ManualWallClock::new(5_000));
    let config = ReplicaConfig::new(DeviceId::new("tablet-c").unwrap(), ActorId::new("c").unwrap())
        .with_wall_clock(wall);
    let replica = Replica::in_memory(config, Arc::new(MergeRuleRegistry::standard().unwrap())).unwrap();

    let mut ops = history();
    let before = replica.cursor(EntityType::Shift);
    ops[7].logical_clock = 1;
    let cursor = shiftsync_protocol::SyncCursor {
        last_op_id: Some(ops[11].op_id),
        last_timestamp: ops[11].client_timestamp,
        position: 12,
    };
    assert!(replica.apply_pull(EntityType::Shift, &ops, cursor).is_err());
    assert_eq!(replica.cursor(EntityType::Shift), before);
    assert_eq!(replica.stats().unwrap().operations, 0);
}
