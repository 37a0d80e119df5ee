//! The operation record.

use crate::chain::{self, ChainHash};
use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{ActorId, DeviceId, EntityId, EntityType, OpId};
use crate::path::FieldPath;
use crate::value::OpValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What an operation does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// Seeds the whole entity. Carries no path.
    Create,
    /// Sets one field.
    Update,
    /// Adds to a collection or log field.
    Append,
    /// Moves a status field along its transition graph.
    Transition,
    /// Terminal transition to the closed state, stamping the end time.
    Signoff,
}

impl OpKind {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Append => "append",
            OpKind::Transition => "transition",
            OpKind::Signoff => "signoff",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        match s {
            "create" => Ok(OpKind::Create),
            "update" => Ok(OpKind::Update),
            "append" => Ok(OpKind::Append),
            "transition" => Ok(OpKind::Transition),
            "signoff" => Ok(OpKind::Signoff),
            other => Err(ProtocolError::UnknownKind(other.to_string())),
        }
    }
}

/// Merge order key: `(logical_clock, client_timestamp, op_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CausalKey {
    /// Logical clock of the operation.
    pub logical_clock: u64,
    /// Wall-clock milliseconds at the recording device.
    pub client_timestamp: i64,
    /// Final tie-break.
    pub op_id: OpId,
}

/// An operation before it is linked into a device chain.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDraft {
    /// Operation id.
    pub op_id: OpId,
    /// Recording device.
    pub device_id: DeviceId,
    /// Recording person.
    pub actor_id: ActorId,
    /// Wall-clock milliseconds at the device.
    pub client_timestamp: i64,
    /// Causal counter from the device clock.
    pub logical_clock: u64,
    /// Target entity type.
    pub entity_type: EntityType,
    /// Target entity.
    pub entity_id: EntityId,
    /// Operation kind.
    pub kind: OpKind,
    /// Target field, absent for whole-entity creates.
    pub path: Option<FieldPath>,
    /// Payload.
    pub value: Option<OpValue>,
}

impl OperationDraft {
    /// Links the draft to `prev_hash` and computes its digest.
    ///
    /// # Errors
    ///
    /// Fails only if the canonical encoding fails.
    pub fn seal(self, prev_hash: Option<ChainHash>) -> ProtocolResult<Operation> {
        let hash = chain::compute_hash(&self, prev_hash.as_ref())?;
        Ok(Operation {
            op_id: self.op_id,
            device_id: self.device_id,
            actor_id: self.actor_id,
            client_timestamp: self.client_timestamp,
            logical_clock: self.logical_clock,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            kind: self.kind,
            path: self.path,
            value: self.value,
            prev_hash,
            hash,
        })
    }
}

/// The atomic, immutable unit of change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation id.
    pub op_id: OpId,
    /// Recording device.
    pub device_id: DeviceId,
    /// Recording person.
    pub actor_id: ActorId,
    /// Wall-clock milliseconds at the device.
    pub client_timestamp: i64,
    /// Causal counter from the device clock.
    pub logical_clock: u64,
    /// Target entity type.
    pub entity_type: EntityType,
    /// Target entity.
    pub entity_id: EntityId,
    /// Operation kind.
    pub kind: OpKind,
    /// Target field, absent for whole-entity creates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<FieldPath>,
    /// Payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<OpValue>,
    /// Hash of the previous operation from the same device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<ChainHash>,
    /// Digest over every other field.
    pub hash: ChainHash,
}

impl Operation {
    /// Returns the merge order key.
    #[must_use]
    pub fn causal_key(&self) -> CausalKey {
        CausalKey {
            logical_clock: self.logical_clock,
            client_timestamp: self.client_timestamp,
            op_id: self.op_id,
        }
    }

    /// Recomputes the digest from the current field values.
    ///
    /// # Errors
    ///
    /// Fails only if the canonical encoding fails.
    pub fn recompute_hash(&self) -> ProtocolResult<ChainHash> {
        chain::hash_fields(&chain::HashInput::from(self), self.prev_hash.as_ref())
    }

    /// Returns true if the stored hash matches the recomputed one.
    #[must_use]
    pub fn hash_is_valid(&self) -> bool {
        self.recompute_hash().is_ok_and(|h| h == self.hash)
    }

    /// Returns true if both operations target the same entity.
    #[must_use]
    pub fn same_entity(&self, other: &Operation) -> bool {
        self.entity_type == other.entity_type && self.entity_id == other.entity_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(clock: u64) -> OperationDraft {
        OperationDraft {
            op_id: OpId::from_u128(u128::from(clock)),
            device_id: DeviceId::new("tablet-1").unwrap(),
            actor_id: ActorId::new("supervisor").unwrap(),
            client_timestamp: 1_700_000_000_000,
            logical_clock: clock,
            entity_type: EntityType::Shift,
            entity_id: EntityId::new("shift-42").unwrap(),
            kind: OpKind::Update,
            path: Some(FieldPath::parse("production.tonnes.mined").unwrap()),
            value: Some(OpValue::Integer(100)),
        }
    }

    #[test]
    fn sealed_hash_is_valid() {
        let op = draft(1).seal(None).unwrap();
        assert!(op.hash_is_valid());
        assert_eq!(op.recompute_hash().unwrap(), op.hash);
    }

    #[test]
    fn editing_a_field_invalidates_hash() {
        let mut op = draft(1).seal(None).unwrap();
        op.value = Some(OpValue::Integer(101));
        assert!(!op.hash_is_valid());
    }

    #[test]
    fn prev_hash_feeds_the_digest() {
        let first = draft(1).seal(None).unwrap();
        let a = draft(2).seal(Some(first.hash)).unwrap();
        let b = draft(2).seal(None).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn causal_key_orders_clock_then_time_then_id() {
        let mut a = draft(1);
        a.client_timestamp = 50;
        let mut b = draft(1);
        b.client_timestamp = 10;
        b.op_id = OpId::from_u128(99);
        let a = a.seal(None).unwrap();
        let b = b.seal(None).unwrap();
        assert!(b.causal_key() < a.causal_key());
        let c = draft(2).seal(None).unwrap();
        assert!(a.causal_key() < c.causal_key());
    }

    #[test]
    fn kind_names() {
        assert_eq!("signoff".parse::<OpKind>().unwrap(), OpKind::Signoff);
        assert!("delete".parse::<OpKind>().is_err());
    }
}
