//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or decoding protocol values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// An identifier was empty or malformed.
    #[error("invalid {kind}: {value:?}")]
    InvalidIdentifier {
        /// Which identifier.
        kind: &'static str,
        /// The offending input.
        value: String,
    },

    /// A field path failed validation.
    #[error("invalid field path {path:?}: {reason}")]
    InvalidFieldPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Entity type name is not known.
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    /// Merge strategy name is not known.
    #[error("unknown merge strategy: {0}")]
    UnknownStrategy(String),

    /// Operation kind name is not known.
    #[error("unknown operation kind: {0}")]
    UnknownKind(String),

    /// A hex digest could not be parsed.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
}
