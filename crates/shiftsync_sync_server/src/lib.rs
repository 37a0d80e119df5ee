//! # shiftsync Sync Server
//!
//! Reference remote authority for shiftsync devices.
//!
//! This crate provides:
//! - Request handling for handshake, pull and push
//! - A server op-log that validates every device's hash chain
//! - [`SyncServer`], which answers CBOR requests through
//!   [`LoopbackServer`](shiftsync_sync_engine::LoopbackServer)
//!
//! # Architecture
//!
//! The authority stores operations with the same [`OpLogStore`] devices use,
//! but checks every device chain for strict continuity. A push is judged
//! operation by operation: accepted operations are persisted in one journal
//! record, and once an operation of a device is refused every later one of
//! that device in the same push is refused too.
//!
//! Pulls are paged per entity type by arrival position on the authority, so
//! a device cursor stays valid however operations interleave.
//!
//! [`OpLogStore`]: shiftsync_core::OpLogStore

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod oplog;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use oplog::ServerOplog;
pub use server::SyncServer;
