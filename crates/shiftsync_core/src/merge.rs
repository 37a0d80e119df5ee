//! Per-step merge functions.
//!
//! Each function combines the value a field currently holds with one
//! incoming value and says whether the step needs a conflict record. The
//! resolver folds these steps over a field's operations in causal order.

use crate::registry::{PriorityScale, TransitionGraph};
use shiftsync_protocol::{CausalKey, ConflictCause, MergeStrategy, OpValue};
use std::cmp::Ordering;

/// Result of one fold step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Replace the current value.
    Apply(OpValue),
    /// Keep the current value.
    Keep,
    /// Replace the current value, recording an informational conflict.
    ApplyFlagged(OpValue, ConflictCause),
    /// Keep the current value and raise a conflict.
    Reject(ConflictCause),
}

impl Step {
    /// The conflict cause, if the step raised one.
    #[must_use]
    pub fn cause(&self) -> Option<ConflictCause> {
        match self {
            Step::ApplyFlagged(_, cause) | Step::Reject(cause) => Some(*cause),
            Step::Apply(_) | Step::Keep => None,
        }
    }
}

/// What a merge step may consult besides the two values.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    /// Transition graph of the entity type, for monotonic fields.
    pub transitions: Option<&'a TransitionGraph>,
    /// Priority ordinal table.
    pub priority: &'a PriorityScale,
}

/// Who wrote the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Writer {
    /// Causal key of the writing operation.
    pub key: CausalKey,
    /// Whether that operation and the incoming one are concurrent.
    pub concurrent: bool,
}

/// Applies `strategy` to one step.
///
/// `current_writer` is `None` when the current value comes from a pruned
/// baseline rather than a live operation.
#[must_use]
pub fn merge_step(
    strategy: MergeStrategy,
    ctx: &MergeContext<'_>,
    current: &OpValue,
    current_writer: Option<Writer>,
    incoming: &OpValue,
    incoming_key: &CausalKey,
) -> Step {
    match strategy {
        MergeStrategy::LastWriteWins => last_write_wins(current_writer, incoming, incoming_key),
        MergeStrategy::SetUnion => Step::Apply(set_union(current, incoming)),
        MergeStrategy::Additive => match add(current, incoming) {
            Some(sum) => Step::Apply(sum),
            None => Step::Reject(ConflictCause::IncompatibleValue),
        },
        MergeStrategy::Monotonic => monotonic(ctx, current, incoming),
        MergeStrategy::AppendOnly => Step::Apply(append(current, incoming)),
        MergeStrategy::MaxValue => extreme(ctx, current, incoming, Ordering::Greater),
        MergeStrategy::MinValue => extreme(ctx, current, incoming, Ordering::Less),
        MergeStrategy::Conflict => Step::Reject(ConflictCause::ManualStrategy),
    }
}

fn last_write_wins(writer: Option<Writer>, incoming: &OpValue, incoming_key: &CausalKey) -> Step {
    let Some(writer) = writer else {
        return Step::Apply(incoming.clone());
    };
    let current = (writer.key.logical_clock, writer.key.client_timestamp);
    let next = (incoming_key.logical_clock, incoming_key.client_timestamp);
    let incoming_wins = match next.cmp(&current) {
        Ordering::Greater => true,
        Ordering::Less => false,
        // Exact tie: the smaller op id holds the field.
        Ordering::Equal => incoming_key.op_id < writer.key.op_id,
    };
    match (incoming_wins, writer.concurrent) {
        (true, false) => Step::Apply(incoming.clone()),
        (true, true) => Step::ApplyFlagged(incoming.clone(), ConflictCause::ConcurrentOverwrite),
        (false, false) => Step::Keep,
        (false, true) => Step::Reject(ConflictCause::ConcurrentOverwrite),
    }
}

fn items(value: &OpValue) -> Vec<OpValue> {
    match value {
        OpValue::List(items) => items.clone(),
        OpValue::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Deduplicated union, sorted canonically so the result does not depend
/// on which side came first.
#[must_use]
pub fn set_union(current: &OpValue, incoming: &OpValue) -> OpValue {
    let mut all = items(current);
    all.extend(items(incoming));
    all.sort();
    all.dedup();
    OpValue::List(all)
}

/// Numeric sum. Integer overflow saturates; mixing in a decimal yields a
/// decimal. `None` if either side is not a number.
#[must_use]
pub fn add(current: &OpValue, incoming: &OpValue) -> Option<OpValue> {
    match (current, incoming) {
        (OpValue::Integer(a), OpValue::Integer(b)) => Some(OpValue::Integer(a.saturating_add(*b))),
        (OpValue::Null, v @ (OpValue::Integer(_) | OpValue::Decimal(_))) => Some(v.clone()),
        (a, b) => Some(OpValue::Decimal(a.as_number()? + b.as_number()?)),
    }
}

fn monotonic(ctx: &MergeContext<'_>, current: &OpValue, incoming: &OpValue) -> Step {
    match (current, incoming) {
        (OpValue::Text(from), OpValue::Text(to)) if from == to => Step::Keep,
        (OpValue::Text(from), OpValue::Text(to)) => match ctx.transitions {
            Some(graph) if graph.allows(from, to) => Step::Apply(incoming.clone()),
            _ => Step::Reject(ConflictCause::MonotonicRejected),
        },
        (OpValue::Null, OpValue::Text(_)) => Step::Apply(incoming.clone()),
        _ => Step::Reject(ConflictCause::MonotonicRejected),
    }
}

/// Concatenation. Nothing already present is dropped.
#[must_use]
pub fn append(current: &OpValue, incoming: &OpValue) -> OpValue {
    match (current, incoming) {
        (OpValue::Null, v) => v.clone(),
        (OpValue::List(a), OpValue::List(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            OpValue::List(out)
        }
        (OpValue::List(a), v) => {
            let mut out = a.clone();
            out.push(v.clone());
            OpValue::List(out)
        }
        (OpValue::Text(a), OpValue::Text(b)) => OpValue::Text(format!("{a}\n{b}")),
        (a, b) => OpValue::List(vec![a.clone(), b.clone()]),
    }
}

/// Orders two values for max/min. `None` when the shapes don't compare.
fn compare(priority: &PriorityScale, a: &OpValue, b: &OpValue) -> Option<Ordering> {
    match (a, b) {
        (OpValue::Integer(x), OpValue::Integer(y)) => Some(x.cmp(y)),
        (OpValue::Timestamp(x), OpValue::Timestamp(y)) => Some(x.cmp(y)),
        (OpValue::Text(x), OpValue::Text(y)) => Some(priority.rank(x).cmp(&priority.rank(y))),
        _ => Some(a.as_number()?.total_cmp(&b.as_number()?)),
    }
}

fn extreme(ctx: &MergeContext<'_>, current: &OpValue, incoming: &OpValue, keep: Ordering) -> Step {
    if matches!(current, OpValue::Null) {
        return Step::Apply(incoming.clone());
    }
    match compare(ctx.priority, incoming, current) {
        Some(order) if order == keep => Step::Apply(incoming.clone()),
        Some(_) => Step::Keep,
        // Shapes that don't compare: the causally later value stands.
        None => Step::Apply(incoming.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiftsync_protocol::OpId;

    fn key(clock: u64, ts: i64, id: u128) -> CausalKey {
        CausalKey {
            logical_clock: clock,
            client_timestamp: ts,
            op_id: OpId::from_u128(id),
        }
    }

    fn list(items: &[&str]) -> OpValue {
        OpValue::List(items.iter().map(|s| OpValue::text(*s)).collect())
    }

    fn ctx<'a>(graph: Option<&'a TransitionGraph>, scale: &'a PriorityScale) -> MergeContext<'a> {
        MergeContext {
            transitions: graph,
            priority: scale,
        }
    }

    #[test]
    fn set_union_is_order_independent() {
        let ab = list(&["a", "b"]);
        let bc = list(&["b", "c"]);
        assert_eq!(set_union(&ab, &bc), list(&["a", "b", "c"]));
        assert_eq!(set_union(&bc, &ab), list(&["a", "b", "c"]));
    }

    #[test]
    fn append_never_shrinks() {
        let a = list(&["x", "y"]);
        let b = list(&["z"]);
        let merged = append(&a, &b);
        assert_eq!(merged.as_list().unwrap().len(), 3);
        assert_eq!(
            append(&OpValue::text("line 1"), &OpValue::text("line 2")),
            OpValue::text("line 1\nline 2")
        );
        assert_eq!(
            append(&OpValue::Integer(1), &OpValue::text("x")),
            OpValue::List(vec![OpValue::Integer(1), OpValue::text("x")])
        );
    }

    #[test]
    fn additive_sums_deltas() {
        assert_eq!(add(&OpValue::Integer(5), &OpValue::Integer(7)), Some(OpValue::Integer(12)));
        assert_eq!(add(&OpValue::Integer(5), &OpValue::Decimal(0.5)), Some(OpValue::Decimal(5.5)));
        assert_eq!(add(&OpValue::Integer(i64::MAX), &OpValue::Integer(1)), Some(OpValue::Integer(i64::MAX)));
        assert_eq!(add(&OpValue::Integer(5), &OpValue::text("five")), None);
    }

    #[test]
    fn max_value_keeps_larger() {
        let scale = PriorityScale::default();
        let c = ctx(None, &scale);
        let k = key(2, 0, 2);
        assert_eq!(
            merge_step(MergeStrategy::MaxValue, &c, &OpValue::Integer(100), None, &OpValue::Integer(120), &k),
            Step::Apply(OpValue::Integer(120))
        );
        assert_eq!(
            merge_step(MergeStrategy::MaxValue, &c, &OpValue::Integer(120), None, &OpValue::Integer(100), &k),
            Step::Keep
        );
        assert_eq!(
            merge_step(MergeStrategy::MinValue, &c, &OpValue::Timestamp(50), None, &OpValue::Timestamp(40), &k),
            Step::Apply(OpValue::Timestamp(40))
        );
    }

    #[test]
    fn max_value_ranks_priorities() {
        let scale = PriorityScale::default();
        let c = ctx(None, &scale);
        let k = key(2, 0, 2);
        assert_eq!(
            merge_step(MergeStrategy::MaxValue, &c, &OpValue::text("MEDIUM"), None, &OpValue::text("CRITICAL"), &k),
            Step::Apply(OpValue::text("CRITICAL"))
        );
        assert_eq!(
            merge_step(MergeStrategy::MaxValue, &c, &OpValue::text("HIGH"), None, &OpValue::text("LOW"), &k),
            Step::Keep
        );
    }

    #[test]
    fn monotonic_rejects_backwards_moves() {
        let graph = TransitionGraph::new()
            .edge("OPEN", "IN_PROGRESS")
            .edge("IN_PROGRESS", "CLOSED");
        let scale = PriorityScale::default();
        let c = ctx(Some(&graph), &scale);
        let k = key(3, 0, 3);
        assert_eq!(
            merge_step(MergeStrategy::Monotonic, &c, &OpValue::text("CLOSED"), None, &OpValue::text("OPEN"), &k),
            Step::Reject(ConflictCause::MonotonicRejected)
        );
        assert_eq!(
            merge_step(MergeStrategy::Monotonic, &c, &OpValue::text("OPEN"), None, &OpValue::text("IN_PROGRESS"), &k),
            Step::Apply(OpValue::text("IN_PROGRESS"))
        );
        assert_eq!(
            merge_step(MergeStrategy::Monotonic, &c, &OpValue::text("OPEN"), None, &OpValue::text("CLOSED"), &k),
            Step::Reject(ConflictCause::MonotonicRejected)
        );
        assert_eq!(
            merge_step(MergeStrategy::Monotonic, &c, &OpValue::text("OPEN"), None, &OpValue::text("OPEN"), &k),
            Step::Keep
        );
    }

    #[test]
    fn last_write_wins_tie_goes_to_smaller_op_id() {
        let scale = PriorityScale::default();
        let c = ctx(None, &scale);
        let writer = Writer {
            key: key(4, 100, 1),
            concurrent: true,
        };
        let step = merge_step(
            MergeStrategy::LastWriteWins,
            &c,
            &OpValue::text("a"),
            Some(writer),
            &OpValue::text("b"),
            &key(4, 100, 2),
        );
        assert_eq!(step, Step::Reject(ConflictCause::ConcurrentOverwrite));

        let later = merge_step(
            MergeStrategy::LastWriteWins,
            &c,
            &OpValue::text("a"),
            Some(Writer {
                key: key(4, 100, 1),
                concurrent: false,
            }),
            &OpValue::text("b"),
            &key(5, 90, 0),
        );
        assert_eq!(later, Step::Apply(OpValue::text("b")));
    }

    #[test]
    fn conflict_strategy_always_rejects() {
        let scale = PriorityScale::default();
        let step = merge_step(
            MergeStrategy::Conflict,
            &ctx(None, &scale),
            &OpValue::Integer(1),
            None,
            &OpValue::Integer(1),
            &key(1, 0, 1),
        );
        assert_eq!(step, Step::Reject(ConflictCause::ManualStrategy));
    }
}
