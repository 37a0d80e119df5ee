//! Conflict resolver.
//!
//! Folds the contributions to one field in causal order through the field's
//! merge strategy and records every step that could not, or should not, be
//! settled silently.

use crate::merge::{merge_step, MergeContext, Step, Writer};
use crate::registry::MergeRuleRegistry;
use shiftsync_protocol::{
    ActorId, CausalKey, ConflictCause, ConflictId, ConflictRecord, DeviceId, EntityId, EntityType,
    FieldPath, MergeStrategy, OpValue, Resolution,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One operation's effect on one field.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    /// Causal key of the contributing operation.
    pub key: CausalKey,
    /// Device that recorded it.
    pub device_id: DeviceId,
    /// Person who recorded it.
    pub actor_id: ActorId,
    /// Strategy applied to this contribution.
    pub strategy: MergeStrategy,
    /// Value carried.
    pub value: OpValue,
}

/// Result of folding one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOutcome {
    /// Final value of the field.
    pub value: OpValue,
    /// Key of the last contribution that changed the field, if any did.
    pub applied: Option<CausalKey>,
    /// Device behind `applied`.
    pub applied_by: Option<(DeviceId, ActorId)>,
    /// Writer holding the field after the fold, the seed included.
    pub writer: Option<FieldWriter>,
    /// Records raised along the way, in fold order.
    pub conflicts: Vec<ConflictRecord>,
}

/// Identifies the field being folded.
#[derive(Debug, Clone, Copy)]
pub struct FieldRef<'a> {
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity.
    pub entity_id: &'a EntityId,
    /// Field.
    pub path: &'a FieldPath,
}

/// The operation whose value a field currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldWriter {
    /// Causal key of the writing operation.
    pub key: CausalKey,
    /// Device that recorded it.
    pub device_id: DeviceId,
    /// Person who recorded it.
    pub actor_id: ActorId,
}

impl FieldWriter {
    fn of(c: &Contribution) -> Self {
        Self {
            key: c.key,
            device_id: c.device_id.clone(),
            actor_id: c.actor_id.clone(),
        }
    }
}

/// Applies merge strategies and stored resolutions.
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver<'a> {
    registry: &'a MergeRuleRegistry,
    resolutions: &'a HashMap<ConflictId, Resolution>,
    window_ms: i64,
}

impl<'a> ConflictResolver<'a> {
    /// Creates a resolver over `registry` with the given reconciliation
    /// window and recorded resolutions.
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

    /// Returns true if two writes were made without seeing each other.
    ///
    /// Writes from the same device are always ordered by its chain. Writes
    /// from different devices count as concurrent when their wall clocks
    /// are within the reconciliation window.
    #[must_use]
    pub fn concurrent(&self, a: (&DeviceId, i64), b: (&DeviceId, i64)) -> bool {
        a.0 != b.0 && a.1.abs_diff(b.1) <= self.window_ms.unsigned_abs()
    }

    /// Folds `contributions`, already in causal order, starting from
    /// `initial`.
    ///
    /// `seed` is the writer of `initial` when it comes from a pruned
    /// baseline, so late operations older than the pruned history lose
    /// to it exactly as they would have before pruning.
    #[must_use]
    pub fn fold_field(
        &self,
        field: FieldRef<'_>,
        initial: Option<&OpValue>,
        seed: Option<&FieldWriter>,
        contributions: &[Contribution],
    ) -> FieldOutcome {
        let ctx = MergeContext {
            transitions: self.registry.transitions(field.entity_type),
            priority: self.registry.priority(),
        };
        let mut current = initial.cloned().unwrap_or(OpValue::Null);
        let mut holder: Option<FieldWriter> = seed.cloned();
        let mut applied: Option<FieldWriter> = None;
        // Every writer folded into the field so far, in fold order.
        let mut history: Vec<FieldWriter> = seed.into_iter().cloned().collect();
        let mut conflicts = Vec::new();

        for c in contributions {
            let writer = holder.as_ref().map(|h| Writer {
                key: h.key,
                concurrent: self.concurrent(
                    (&h.device_id, h.key.client_timestamp),
                    (&c.device_id, c.key.client_timestamp),
                ),
            });
            let before = current.clone();
            let step = merge_step(c.strategy, &ctx, &current, writer, &c.value, &c.key);
            let this = FieldWriter::of(c);

            let (changed_to, record) = match step {
                Step::Apply(v) => (Some(v), None),
                Step::Keep => (None, None),
                Step::ApplyFlagged(v, cause) => (Some(v), Some((cause, false, None))),
                Step::Reject(ConflictCause::ConcurrentOverwrite) => {
                    (None, Some((ConflictCause::ConcurrentOverwrite, false, None)))
                }
                Step::Reject(cause) => {
                    let id = ConflictId::derive(
                        field.entity_type,
                        field.entity_id,
                        field.path,
                        &c.key.op_id,
                    );
                    match self.resolutions.get(&id) {
                        Some(Resolution::KeepCurrent) => {
                            (None, Some((cause, true, Some(Resolution::KeepCurrent))))
                        }
                        Some(Resolution::AcceptProposed) => (
                            Some(c.value.clone()),
                            Some((cause, true, Some(Resolution::AcceptProposed))),
                        ),
                        Some(Resolution::Override(v)) => (
                            Some(v.clone()),
                            Some((cause, true, Some(Resolution::Override(v.clone())))),
                        ),
                        None => (None, Some((cause, true, None))),
                    }
                }
            };

            if let Some(v) = changed_to {
                current = v;
                holder = Some(this.clone());
                applied = Some(this.clone());
            }

            if let Some((cause, requires_approval, resolution)) = record {
                conflicts.push(self.record(
                    field,
                    c,
                    &history,
                    cause,
                    requires_approval,
                    resolution,
                    before,
                    current.clone(),
                ));
            }
            history.push(this);
        }

        FieldOutcome {
            value: current,
            applied: applied.as_ref().map(|w| w.key),
            applied_by: applied.map(|w| (w.device_id, w.actor_id)),
            writer: holder,
            conflicts,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        field: FieldRef<'_>,
        incoming: &Contribution,
        earlier: &[FieldWriter],
        cause: ConflictCause,
        requires_approval: bool,
        resolution: Option<Resolution>,
        retained: OpValue,
        resulting: OpValue,
    ) -> ConflictRecord {
        let mut contending = Vec::with_capacity(earlier.len() + 1);
        let mut participants = Vec::with_capacity(earlier.len() + 1);
        let mut first_seen = incoming.key.client_timestamp;
        let mut last_seen = incoming.key.client_timestamp;
        for w in earlier {
            contending.push(w.key.op_id);
            participants.push(w.actor_id.clone());
            first_seen = first_seen.min(w.key.client_timestamp);
            last_seen = last_seen.max(w.key.client_timestamp);
        }
        contending.push(incoming.key.op_id);
        participants.push(incoming.actor_id.clone());
        participants.sort();
        participants.dedup();

        ConflictRecord {
            conflict_id: ConflictId::derive(
                field.entity_type,
                field.entity_id,
                field.path,
                &incoming.key.op_id,
            ),
            entity_type: field.entity_type,
            entity_id: field.entity_id.clone(),
            field_path: field.path.clone(),
            strategy: incoming.strategy,
            cause,
            contending,
            participants,
            retained_value: Some(retained),
            proposed_value: Some(incoming.value.clone()),
            resulting_value: Some(resulting),
            first_seen,
            last_seen,
            requires_approval,
            resolved: !requires_approval || resolution.is_some(),
            resolution,
        }
    }
}
