//! Error types for the sync server.

use shiftsync_core::CoreError;
use shiftsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request body could not be decoded, or a response encoded.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Unknown endpoint.
    #[error("no such endpoint: {0}")]
    NotFound(String),

    /// The server op-log failed.
    #[error("op-log error: {0}")]
    Oplog(#[from] CoreError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_) | ServerError::Codec(_) | ServerError::NotFound(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Oplog(_) | ServerError::Internal(_))
    }

    /// HTTP status for the error.
    pub fn status(&self) -> u16 {
        match self {
            ServerError::NotFound(_) => 404,
            e if e.is_client_error() => 400,
            _ => 500,
        }
    }
}
