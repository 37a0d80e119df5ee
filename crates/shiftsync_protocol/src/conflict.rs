//! Conflict records and merge strategy names.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{ActorId, EntityId, EntityType, OpId};
use crate::path::FieldPath;
use crate::value::OpValue;
use hex::FromHex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// How concurrent values for one field are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Causally latest value wins.
    LastWriteWins,
    /// Deduplicated union of collections.
    SetUnion,
    /// Numeric sum of deltas.
    Additive,
    /// Forward moves along the entity type's transition graph only.
    Monotonic,
    /// Concatenation in causal order.
    AppendOnly,
    /// Largest value, priority rank for text.
    MaxValue,
    /// Smallest value.
    MinValue,
    /// Always deferred to manual resolution.
    Conflict,
}

impl MergeStrategy {
    /// Returns the configuration name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::LastWriteWins => "last-write-wins",
            MergeStrategy::SetUnion => "set-union",
            MergeStrategy::Additive => "additive",
            MergeStrategy::Monotonic => "monotonic",
            MergeStrategy::AppendOnly => "append-only",
            MergeStrategy::MaxValue => "max-value",
            MergeStrategy::MinValue => "min-value",
            MergeStrategy::Conflict => "conflict",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        [
            MergeStrategy::LastWriteWins,
            MergeStrategy::SetUnion,
            MergeStrategy::Additive,
            MergeStrategy::Monotonic,
            MergeStrategy::AppendOnly,
            MergeStrategy::MaxValue,
            MergeStrategy::MinValue,
            MergeStrategy::Conflict,
        ]
        .into_iter()
        .find(|m| m.as_str() == s)
        .ok_or_else(|| ProtocolError::UnknownStrategy(s.to_string()))
    }
}

/// Stable identifier of a conflict.
///
/// Derived from the entity, the field and the operation that could not be
/// applied, so replaying the same operations yields the same id and a
/// stored resolution keeps applying.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConflictId([u8; 16]);

impl ConflictId {
    /// Derives the id for `incoming` contending on `path`.
    #[must_use]
    pub fn derive(
        entity_type: EntityType,
        entity_id: &EntityId,
        path: &FieldPath,
        incoming: &OpId,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(entity_type.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(entity_id.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(path.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(incoming.as_bytes());
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }
}

impl fmt::Debug for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConflictId({})", hex::encode(self.0))
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ConflictId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        <[u8; 16]>::from_hex(s)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidDigest(s.to_string()))
    }
}

impl Serialize for ConflictId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ConflictId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Why a conflict record was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictCause {
    /// A transition that is not an edge from the current state.
    MonotonicRejected,
    /// The field's rule defers every contention to a person.
    ManualStrategy,
    /// A concurrent write was superseded by last-write-wins.
    ConcurrentOverwrite,
    /// Concurrent writes to a field and one of its ancestors.
    OverlappingWrite,
    /// A value whose shape the strategy cannot combine.
    IncompatibleValue,
}

/// How a person settled a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "value", rename_all = "kebab-case")]
pub enum Resolution {
    /// Keep the retained value and drop the proposal.
    KeepCurrent,
    /// Apply the proposed value.
    AcceptProposed,
    /// Apply a value chosen by the reviewer.
    Override(OpValue),
}

/// A contention the merge could not, or should not, settle on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Stable id.
    pub conflict_id: ConflictId,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity.
    pub entity_id: EntityId,
    /// Contended field.
    pub field_path: FieldPath,
    /// Strategy that was applied.
    pub strategy: MergeStrategy,
    /// Why the record exists.
    pub cause: ConflictCause,
    /// Every operation that wrote the field up to the contested step, in causal order.
    pub contending: Vec<OpId>,
    /// Distinct actors behind the contending operations, sorted.
    pub participants: Vec<ActorId>,
    /// Value before the contested step.
    pub retained_value: Option<OpValue>,
    /// Value the incoming operation carried.
    pub proposed_value: Option<OpValue>,
    /// Value the field holds after the step.
    pub resulting_value: Option<OpValue>,
    /// Earliest client timestamp among the contending operations.
    pub first_seen: i64,
    /// Latest client timestamp among the contending operations.
    pub last_seen: i64,
    /// Whether a person must decide.
    pub requires_approval: bool,
    /// Whether the conflict is settled.
    pub resolved: bool,
    /// The decision, once one has been recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

impl ConflictRecord {
    /// Wall-clock spread between the contending operations.
    #[must_use]
    pub fn time_spread_ms(&self) -> i64 {
        self.last_seen.saturating_sub(self.first_seen)
    }

    /// Returns true if the record still waits for a person.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names_roundtrip() {
        for name in ["last-write-wins", "set-union", "append-only", "max-value", "conflict"] {
            assert_eq!(name.parse::<MergeStrategy>().unwrap().as_str(), name);
        }
        assert!("newest".parse::<MergeStrategy>().is_err());
    }

    #[test]
    fn conflict_ids_are_stable_and_distinct() {
        let entity = EntityId::new("shift-1").unwrap();
        let path = FieldPath::parse("status").unwrap();
        let a = ConflictId::derive(EntityType::Shift, &entity, &path, &OpId::from_u128(1));
        let b = ConflictId::derive(EntityType::Shift, &entity, &path, &OpId::from_u128(1));
        let c = ConflictId::derive(EntityType::Shift, &entity, &path, &OpId::from_u128(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().parse::<ConflictId>().unwrap(), a);
    }

    #[test]
    fn spread_of_extreme_timestamps_saturates() {
        let record = ConflictRecord {
            conflict_id: ConflictId::derive(
                EntityType::Shift,
                &EntityId::new("shift-1").unwrap(),
                &FieldPath::parse("notes").unwrap(),
                &OpId::from_u128(1),
            ),
            entity_type: EntityType::Shift,
            entity_id: EntityId::new("shift-1").unwrap(),
            field_path: FieldPath::parse("notes").unwrap(),
            strategy: MergeStrategy::Conflict,
            cause: ConflictCause::ManualStrategy,
            contending: vec![OpId::from_u128(1)],
            participants: Vec::new(),
            retained_value: None,
            proposed_value: None,
            resulting_value: None,
            first_seen: i64::MIN,
            last_seen: i64::MAX,
            requires_approval: true,
            resolved: false,
            resolution: None,
        };
        assert_eq!(record.time_spread_ms(), i64::MAX);
    }

    #[test]
    fn resolution_serde() {
        let json = serde_json::to_string(&Resolution::Override(OpValue::text("CLOSED"))).unwrap();
        let back: Resolution = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Resolution::Override(OpValue::text("CLOSED")));
        let keep = serde_json::to_string(&Resolution::KeepCurrent).unwrap();
        assert_eq!(keep, r#"{"decision":"keep-current"}"#);
    }
}
