//! Wire messages exchanged with the remote authority.

use crate::chain::ChainHash;
use crate::cursor::SyncCursor;
use crate::ids::{DeviceId, EntityType, OpId};
use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// Every message that crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Client hello.
    HandshakeRequest(HandshakeRequest),
    /// Authority hello.
    HandshakeResponse(HandshakeResponse),
    /// Request operations of one entity type.
    PullRequest(PullRequest),
    /// Operations of one entity type.
    PullResponse(PullResponse),
    /// Upload unpushed operations.
    PushRequest(PushRequest),
    /// Per-operation verdicts.
    PushResponse(PushResponse),
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::HandshakeRequest(_) => 1,
            SyncMessage::HandshakeResponse(_) => 2,
            SyncMessage::PullRequest(_) => 3,
            SyncMessage::PullResponse(_) => 4,
            SyncMessage::PushRequest(_) => 5,
            SyncMessage::PushResponse(_) => 6,
        }
    }
}

/// Handshake request from a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Device opening the session.
    pub device_id: DeviceId,
    /// Protocol version the device speaks.
    pub protocol_version: u16,
}

impl HandshakeRequest {
    /// Creates a request for the current protocol version.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Handshake response from the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Protocol version the authority speaks.
    pub protocol_version: u16,
    /// Authority wall clock in milliseconds.
    pub server_time: i64,
    /// Whether the session may proceed.
    pub accepted: bool,
    /// Reason when not accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Upload of locally unpushed operations, in `op_id` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Device pushing.
    pub device_id: DeviceId,
    /// Operations to persist.
    pub ops: Vec<Operation>,
}

/// Why the authority refused an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum RejectReason {
    /// The digest does not match the operation's fields.
    HashMismatch,
    /// `prev_hash` does not match the authority's tip for the device.
    BrokenChain {
        /// The authority's tip.
        expected: Option<ChainHash>,
        /// The link the operation carried.
        found: Option<ChainHash>,
    },
    /// The logical clock did not advance past the device tip.
    ClockRegression {
        /// Logical clock of the tip.
        tip: u64,
        /// Logical clock carried.
        found: u64,
    },
    /// An earlier operation of the same device was rejected in this push.
    AfterBrokenLink {
        /// First rejected operation of the device.
        first_rejected: OpId,
    },
    /// Same `op_id` as a stored operation but different content.
    ConflictingDuplicate,
    /// The operation was malformed.
    Malformed {
        /// Details.
        message: String,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::HashMismatch => f.write_str("hash mismatch"),
            RejectReason::BrokenChain { expected, found } => {
                write!(f, "broken chain (expected {expected:?}, found {found:?})")
            }
            RejectReason::ClockRegression { tip, found } => {
                write!(f, "logical clock {found} does not advance past {tip}")
            }
            RejectReason::AfterBrokenLink { first_rejected } => {
                write!(f, "follows rejected operation {first_rejected}")
            }
            RejectReason::ConflictingDuplicate => f.write_str("op_id reused with different content"),
            RejectReason::Malformed { message } => write!(f, "malformed: {message}"),
        }
    }
}

/// One refused operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedOp {
    /// The refused operation.
    pub op_id: OpId,
    /// Why.
    pub reason: RejectReason,
}

/// Per-operation verdicts for a push.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PushResponse {
    /// Persisted, or already known, operations.
    pub accepted: Vec<OpId>,
    /// Refused operations.
    pub rejected: Vec<RejectedOp>,
}

impl PushResponse {
    /// Returns true if nothing was refused.
    #[must_use]
    pub fn is_fully_accepted(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Request for operations of one entity type past a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Entity type to pull.
    pub entity_type: EntityType,
    /// Client's cursor for that type.
    pub cursor: SyncCursor,
    /// Maximum operations to return.
    pub limit: u32,
}

/// A page of operations of one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Entity type pulled.
    pub entity_type: EntityType,
    /// Operations in causal order.
    pub ops: Vec<Operation>,
    /// Cursor to store once the page is applied.
    pub next_cursor: SyncCursor,
    /// Whether another page is waiting.
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decode, Encode};

    #[test]
    fn messages_roundtrip_through_cbor() {
        let msg = SyncMessage::PullRequest(PullRequest {
            entity_type: EntityType::Action,
            cursor: SyncCursor::start(),
            limit: 250,
        });
        let back = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.type_code(), 3);
    }

    #[test]
    fn reject_reasons_are_distinct_on_the_wire() {
        let response = PushResponse {
            accepted: vec![OpId::from_u128(1)],
            rejected: vec![
                RejectedOp {
                    op_id: OpId::from_u128(2),
                    reason: RejectReason::BrokenChain {
                        expected: None,
                        found: None,
                    },
                },
                RejectedOp {
                    op_id: OpId::from_u128(3),
                    reason: RejectReason::AfterBrokenLink {
                        first_rejected: OpId::from_u128(2),
                    },
                },
            ],
        };
        let back = PushResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(back, response);
        assert!(!back.is_fully_accepted());
    }
}
