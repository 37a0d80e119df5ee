//! # shiftsync storage
//!
//! Append-only byte stores for the shiftsync op-log and clock state.
//!
//! Backends are **opaque byte stores**: they append, read back and make
//! data durable. They know nothing about operations or hash chains. The
//! [`frame`] module adds the one piece of structure every journal needs:
//! length-prefixed, checksummed records that can be scanned back after a
//! crash, with a torn trailing record detected and cut off.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral replicas; clones share bytes
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use shiftsync_storage::{frame, InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! frame::append_frame(&mut backend, b"first").unwrap();
//! frame::append_frame(&mut backend, b"second").unwrap();
//!
//! let scan = frame::scan_frames(&backend).unwrap();
//! assert_eq!(scan.frames.len(), 2);
//! assert_eq!(scan.frames[1].payload, b"second");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
pub mod frame;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use frame::{Frame, FrameScan};
pub use memory::InMemoryBackend;
