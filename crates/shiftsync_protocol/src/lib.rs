//! # shiftsync protocol
//!
//! Operation model and sync wire contract for shiftsync.
//!
//! This crate provides:
//! - Identifiers (`OpId`, `DeviceId`, `ActorId`, `EntityId`) and the closed
//!   `EntityType` enum
//! - `FieldPath` dotted field locators and the `OpValue` tagged union
//! - `Operation`, the immutable unit of change, and its causal ordering key
//! - The hash-chain codec (`compute_hash`, `verify_chain`)
//! - Conflict records and merge strategy names shared with diagnostics
//! - Push/pull/handshake messages and their CBOR encoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod chain;
pub mod codec;
mod conflict;
mod cursor;
mod error;
mod ids;
mod messages;
mod operation;
mod path;
pub mod value;

pub use chain::{compute_hash, verify_chain, verify_chain_from, ChainHash, ChainViolation, ViolationKind};
pub use codec::{Decode, Encode};
pub use conflict::{ConflictCause, ConflictId, ConflictRecord, MergeStrategy, Resolution};
pub use cursor::SyncCursor;
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{ActorId, DeviceId, EntityId, EntityType, OpId};
pub use messages::{
    HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest, PushResponse,
    RejectReason, RejectedOp, SyncMessage, PROTOCOL_VERSION,
};
pub use operation::{CausalKey, OpKind, Operation, OperationDraft};
pub use path::FieldPath;
pub use value::{OpValue, Record};
