//! Hash-chain codec.
//!
//! Each operation's digest covers every field except the digest itself,
//! followed by the previous digest of the same device:
//!
//! ```text
//! hash = SHA-256( CBOR(op_id, device_id, actor_id, client_timestamp,
//!                      logical_clock, entity_type, entity_id, kind,
//!                      path, value) || prev_hash )
//! ```
//!
//! Editing any recorded field, or splicing an operation out of a device's
//! sequence, breaks the equality checks in [`verify_chain`].

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{ActorId, DeviceId, EntityId, EntityType, OpId};
use crate::operation::{OpKind, Operation, OperationDraft};
use crate::path::FieldPath;
use crate::value::OpValue;
use hex::FromHex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A SHA-256 digest linking an operation into its device chain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainHash([u8; 32]);

impl ChainHash {
    /// Wraps raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lower-case hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainHash({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ChainHash {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        <[u8; 32]>::from_hex(s)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidDigest(s.to_string()))
    }
}

impl Serialize for ChainHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChainHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Canonical view of the hashed fields.
#[derive(Serialize)]
pub(crate) struct HashInput<'a> {
    op_id: &'a OpId,
    device_id: &'a DeviceId,
    actor_id: &'a ActorId,
    client_timestamp: i64,
    logical_clock: u64,
    entity_type: EntityType,
    entity_id: &'a EntityId,
    kind: OpKind,
    path: Option<&'a FieldPath>,
    value: Option<&'a OpValue>,
}

impl<'a> From<&'a Operation> for HashInput<'a> {
    fn from(op: &'a Operation) -> Self {
        Self {
            op_id: &op.op_id,
            device_id: &op.device_id,
            actor_id: &op.actor_id,
            client_timestamp: op.client_timestamp,
            logical_clock: op.logical_clock,
            entity_type: op.entity_type,
            entity_id: &op.entity_id,
            kind: op.kind,
            path: op.path.as_ref(),
            value: op.value.as_ref(),
        }
    }
}

impl<'a> From<&'a OperationDraft> for HashInput<'a> {
    fn from(op: &'a OperationDraft) -> Self {
        Self {
            op_id: &op.op_id,
            device_id: &op.device_id,
            actor_id: &op.actor_id,
            client_timestamp: op.client_timestamp,
            logical_clock: op.logical_clock,
            entity_type: op.entity_type,
            entity_id: &op.entity_id,
            kind: op.kind,
            path: op.path.as_ref(),
            value: op.value.as_ref(),
        }
    }
}

pub(crate) fn hash_fields(input: &HashInput<'_>, prev_hash: Option<&ChainHash>) -> ProtocolResult<ChainHash> {
    let mut encoded = Vec::with_capacity(256);
    ciborium::into_writer(input, &mut encoded).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    if let Some(prev) = prev_hash {
        hasher.update(prev.as_bytes());
    }
    Ok(ChainHash(hasher.finalize().into()))
}

/// Computes the digest of `op` linked after `prev_hash`.
///
/// # Errors
///
/// Fails only if the canonical encoding fails.
pub fn compute_hash(op: &OperationDraft, prev_hash: Option<&ChainHash>) -> ProtocolResult<ChainHash> {
    hash_fields(&HashInput::from(op), prev_hash)
}

/// How a chain check failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// The stored digest does not match the recomputed one.
    HashMismatch {
        /// Digest carried by the operation.
        stored: ChainHash,
        /// Digest recomputed from its fields.
        computed: ChainHash,
    },
    /// The link to the predecessor is wrong.
    PrevHashMismatch {
        /// Digest of the predecessor.
        expected: Option<ChainHash>,
        /// Link carried by the operation.
        found: Option<ChainHash>,
    },
    /// An operation from another device was mixed into the chain.
    ForeignDevice {
        /// Device the chain belongs to.
        expected: DeviceId,
        /// Device on the operation.
        found: DeviceId,
    },
    /// Two operations of one device link to the same predecessor.
    Fork {
        /// The operation already holding that link.
        existing: OpId,
    },
    /// An `op_id` already stored arrived with different content.
    ReusedOpId {
        /// Digest of the stored operation.
        stored: ChainHash,
        /// Digest of the arriving one.
        incoming: ChainHash,
    },
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::HashMismatch { stored, computed } => {
                write!(f, "hash mismatch (stored {stored:?}, computed {computed:?})")
            }
            ViolationKind::PrevHashMismatch { expected, found } => {
                write!(f, "prev_hash mismatch (expected {expected:?}, found {found:?})")
            }
            ViolationKind::ForeignDevice { expected, found } => {
                write!(f, "operation from {found} in chain of {expected}")
            }
            ViolationKind::Fork { existing } => {
                write!(f, "fork: predecessor already continued by {existing}")
            }
            ViolationKind::ReusedOpId { stored, incoming } => {
                write!(f, "op id reused (stored {stored:?}, incoming {incoming:?})")
            }
        }
    }
}

/// A broken device chain.
///
/// `rejected` lists the offending operation followed by everything after
/// it in the checked sequence; none of them may be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("chain integrity violation on {device_id} at index {index} ({op_id}): {kind}")]
pub struct ChainViolation {
    /// Device whose chain is broken.
    pub device_id: DeviceId,
    /// Position of the offending operation in the checked sequence.
    pub index: usize,
    /// The offending operation.
    pub op_id: OpId,
    /// What failed.
    pub kind: ViolationKind,
    /// Offending operation and all later ones.
    pub rejected: Vec<OpId>,
}

/// Verifies a device's operations in chain order, anchored at the first
/// operation's own `prev_hash`.
///
/// Use this for a retained suffix of a chain whose start was pruned.
///
/// # Errors
///
/// Returns the first [`ChainViolation`].
pub fn verify_chain(ops: &[Operation]) -> Result<(), ChainViolation> {
    match ops.first() {
        Some(first) => verify_chain_from(first.prev_hash.as_ref(), ops),
        None => Ok(()),
    }
}

/// Verifies a device's operations in chain order, requiring the first
/// operation to link to `anchor` (`None` for the start of a chain).
///
/// # Errors
///
/// Returns the first [`ChainViolation`].
pub fn verify_chain_from(anchor: Option<&ChainHash>, ops: &[Operation]) -> Result<(), ChainViolation> {
    let Some(first) = ops.first() else {
        return Ok(());
    };
    let device = &first.device_id;
    let mut expected_prev = anchor.copied();

    for (index, op) in ops.iter().enumerate() {
        let fail = |kind: ViolationKind| ChainViolation {
            device_id: device.clone(),
            index,
            op_id: op.op_id,
            kind,
            rejected: ops[index..].iter().map(|o| o.op_id).collect(),
        };

        if &op.device_id != device {
            return Err(fail(ViolationKind::ForeignDevice {
                expected: device.clone(),
                found: op.device_id.clone(),
            }));
        }
        if op.prev_hash != expected_prev {
            return Err(fail(ViolationKind::PrevHashMismatch {
                expected: expected_prev,
                found: op.prev_hash,
            }));
        }
        let computed = op.recompute_hash().map_err(|_| {
            fail(ViolationKind::HashMismatch {
                stored: op.hash,
                computed: ChainHash([0u8; 32]),
            })
        })?;
        if computed != op.hash {
            return Err(fail(ViolationKind::HashMismatch {
                stored: op.hash,
                computed,
            }));
        }
        expected_prev = Some(computed);
    }
    Ok(())
}
