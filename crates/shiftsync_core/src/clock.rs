//! Causal clock and wall-clock sources.
//!
//! The causal clock hands out logical timestamps that strictly increase
//! on this device, across restarts. Every issued value is persisted as a
//! 12-byte frame before it is returned:
//!
//! ```text
//! ┌──────────────┬──────────────────────────┐
//! │ value u64 LE │ SHA-256(value)[..4]      │
//! └──────────────┴──────────────────────────┘
//! ```
//!
//! If the state cannot be read back exactly, the clock refuses to open.
//! Guessing a value could hand out a number already used, which would let
//! a new operation sort before older ones.
//!
//! Opening rewrites the state as a single frame. A crash in the middle of
//! that leaves an empty file; the replica then recovers the high-water
//! mark from the op-log, which holds every value ever used.

use crate::error::{CoreError, CoreResult};
use sha2::{Digest, Sha256};
use shiftsync_storage::StorageBackend;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const FRAME_LEN: usize = 12;

/// Largest logical clock an operation may carry.
///
/// The space above is kept free so that observing a peer's clock can never
/// leave this device unable to issue its own.
pub const MAX_LOGICAL_CLOCK: u64 = u64::MAX - (1 << 32);

fn frame(value: u64) -> [u8; FRAME_LEN] {
    let bytes = value.to_le_bytes();
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; FRAME_LEN];
    out[..8].copy_from_slice(&bytes);
    out[8..].copy_from_slice(&digest[..4]);
    out
}

/// Per-device logical clock.
pub struct CausalClock {
    backend: Box<dyn StorageBackend>,
    current: u64,
}

impl CausalClock {
    /// Opens the clock, reading the last persisted value.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ClockUnavailable`] if the state is unreadable,
    /// truncated, fails its checksum or goes backwards.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let data = backend
            .read_all()
            .map_err(|e| CoreError::clock_unavailable(format!("read failed: {e}")))?;
        if data.len() % FRAME_LEN != 0 {
            return Err(CoreError::clock_unavailable(format!(
                "state is {} bytes, not a whole number of frames",
                data.len()
            )));
        }

        let mut current = 0u64;
        for (i, chunk) in data.chunks_exact(FRAME_LEN).enumerate() {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&chunk[..8]);
            let value = u64::from_le_bytes(bytes);
            if frame(value)[8..] != chunk[8..] {
                return Err(CoreError::clock_unavailable(format!(
                    "checksum mismatch in frame {i}"
                )));
            }
            if value <= current && i > 0 {
                return Err(CoreError::clock_unavailable(format!(
                    "frame {i} regresses from {current} to {value}"
                )));
            }
            current = value;
        }

        let mut clock = Self { backend, current };
        if data.len() > FRAME_LEN {
            clock.compact()?;
        }
        Ok(clock)
    }

    fn compact(&mut self) -> CoreResult<()> {
        self.backend.truncate(0)?;
        self.backend.append(&frame(self.current))?;
        self.backend.sync()?;
        debug!(current = self.current, "clock state compacted");
        Ok(())
    }

    /// Returns the last issued or observed value.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Issues the next value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be persisted. The clock does
    /// not advance in that case.
    pub fn next(&mut self) -> CoreResult<u64> {
        let value = self
            .current
            .checked_add(1)
            .ok_or_else(|| CoreError::clock_unavailable("logical clock exhausted"))?;
        self.persist(value)?;
        Ok(value)
    }

    /// Raises the clock to at least `seen`.
    ///
    /// # Errors
    ///
    /// Returns an error if the new value cannot be persisted.
    pub fn observe(&mut self, seen: u64) -> CoreResult<()> {
        if seen > self.current {
            self.persist(seen)?;
        }
        Ok(())
    }

    fn persist(&mut self, value: u64) -> CoreResult<()> {
        self.backend.append(&frame(value))?;
        self.backend.sync()?;
        self.current = value;
        Ok(())
    }
}

impl std::fmt::Debug for CausalClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CausalClock")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

/// Source of wall-clock milliseconds for `client_timestamp`.
pub trait WallClock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// A hand-driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualWallClock {
    now: AtomicI64,
}

impl ManualWallClock {
    /// Starts at `now` milliseconds.
    #[must_use]
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jumps to an absolute time.
    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl WallClock for ManualWallClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
