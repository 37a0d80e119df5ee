//! # Shiftsync Sync Engine
//!
//! Moves operations between a device replica and the remote authority.
//!
//! This crate provides:
//! - Sync state machine (idle → connecting → pushing → pulling → synced)
//! - Per entity type pull cursors, advanced only after a page is applied
//! - Partial push acknowledgement: only accepted operations are marked
//! - Retry queue with exponential backoff and quarantine
//! - A background worker driven by connectivity, foreground and timer signals
//! - HTTP transport abstraction with an in-process loopback client
//! - The replica as the local side of a sync
//!
//! ## Architecture
//!
//! A sync cycle pushes before it pulls so that the authority validates local
//! operations against their own chain before anything new arrives. Each
//! pulled page is applied atomically together with its cursor, so a cycle
//! that dies halfway resumes where it stopped.
//!
//! Network calls are async and bounded by [`SyncConfig::timeout`]; they never
//! hold a replica lock, so local writes continue while a sync runs.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod http;
mod replica_applier;
mod retry;
mod state;
mod transport;
mod worker;

pub use config::{RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use http::{
    HttpClient, HttpResponse, HttpTransport, LoopbackClient, LoopbackServer, HANDSHAKE_PATH,
    PULL_PATH, PUSH_PATH,
};
pub use retry::{BatchEntry, BatchKey, BatchState, QuarantinedBatch, QueueStatus, RetryDecision, RetryQueue};
pub use state::{SyncApplier, SyncCycleResult, SyncEngine, SyncState, SyncStats};
pub use transport::{MockTransport, SyncTransport};
pub use worker::{RetryWorker, SyncSignal};
