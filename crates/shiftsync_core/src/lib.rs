//! # shiftsync Core
//!
//! The local replica of the shiftsync op-log.
//!
//! This crate provides:
//! - A persisted causal clock that fails closed
//! - The op-log store: journal, chain checks, indexes, cursors, retention
//! - The merge rule registry and the per-strategy merge functions
//! - The conflict resolver and advisory conflict scoring
//! - The entity projector that rebuilds state from operations
//! - [`Replica`], the context object applications hold
//!
//! ## Example
//!
//! ```rust,ignore
//! use shiftsync_core::{MergeRuleRegistry, Replica, ReplicaConfig};
//! use shiftsync_protocol::{ActorId, DeviceId, EntityId, EntityType, FieldPath, OpKind};
//! use std::sync::Arc;
//!
//! let config = ReplicaConfig::new(DeviceId::new("tablet-7")?, ActorId::new("j.smith")?);
//! let replica = Replica::open("replica".as_ref(), config, Arc::new(MergeRuleRegistry::standard()?))?;
//! let shift = EntityId::new("shift-2024-06-01-A")?;
//! replica.record(EntityType::Shift, shift.clone(), OpKind::Create, None, None)?;
//! replica.record(
//!     EntityType::Shift,
//!     shift.clone(),
//!     OpKind::Update,
//!     Some(FieldPath::parse("production.tonnes.mined")?),
//!     Some(1_250.into()),
//! )?;
//! let entity = replica.get_entity(EntityType::Shift, &shift)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
#[cfg(feature = "std")]
mod dir;
mod error;
mod journal;
mod merge;
mod projector;
mod registry;
mod replica;
mod resolver;
mod scoring;
mod store;

pub use clock::{CausalClock, ManualWallClock, SystemWallClock, WallClock, MAX_LOGICAL_CLOCK};
pub use config::{ReplicaConfig, DEFAULT_RECONCILIATION_WINDOW, DEFAULT_RETENTION};
#[cfg(feature = "std")]
pub use dir::ReplicaDir;
pub use error::{CoreError, CoreResult};
pub use journal::{Journal, JournalRecord};
pub use merge::{add, append, merge_step, set_union, MergeContext, Step, Writer};
pub use projector::{Baseline, Entity, EntityFilter, EntityProjector, Projection};
pub use registry::{
    Lifecycle, LifecycleConfig, MergeRule, MergeRuleRegistry, PriorityScale, RegistryBuilder,
    RegistryConfig, RuleConfig, TransitionConfig, TransitionGraph,
};
pub use replica::{ApplyReport, PruneReport, Replica, SyncStatus};
pub use resolver::{ConflictResolver, Contribution, FieldOutcome, FieldRef, FieldWriter};
pub use scoring::{
    rank_conflicts, score_conflict, Complexity, ConflictScore, Recommendation, RiskFactor,
};
pub use store::{
    reject_reason, AppendOutcome, BatchVerdict, ChainCheck, ChainTip, EntityKey, LocalOperation,
    OpLogStore, OperationPage, StoreStats,
};
