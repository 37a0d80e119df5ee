//! Checksummed record framing.
//!
//! Every journal record is written as one frame:
//!
//! ```text
//! ┌────────┬────────────┬─────────────┬──────────────┐
//! │ magic  │ length     │ payload     │ checksum     │
//! │ 4 bytes│ u32 LE     │ length bytes│ 4 bytes      │
//! └────────┴────────────┴─────────────┴──────────────┘
//! ```
//!
//! The checksum is the first four bytes of the SHA-256 of the payload.
//! A frame is written with a single append, so after a crash at most the
//! last frame can be incomplete. [`scan_frames`] reports such a torn tail
//! separately from damage earlier in the file, which is never repaired.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use sha2::{Digest, Sha256};

/// Marks the start of every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"SSJ1";

const HEADER_LEN: usize = 8;
const CHECKSUM_LEN: usize = 4;

/// Largest payload a frame accepts.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Offset of the frame header.
    pub offset: u64,
    /// Frame payload.
    pub payload: Vec<u8>,
}

/// Result of scanning a backend.
#[derive(Debug, Clone, Default)]
pub struct FrameScan {
    /// Complete frames in write order.
    pub frames: Vec<Frame>,
    /// Length of the valid prefix, where the next frame should go.
    pub valid_len: u64,
    /// Whether bytes after `valid_len` form an incomplete final frame.
    pub torn_tail: bool,
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Encodes `payload` as a frame.
///
/// # Errors
///
/// Returns [`StorageError::PayloadTooLarge`] past [`MAX_PAYLOAD`].
pub fn encode_frame(payload: &[u8]) -> StorageResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(StorageError::PayloadTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
    out.extend_from_slice(&FRAME_MAGIC);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&checksum(payload));
    Ok(out)
}

/// Appends one frame and syncs it. Returns the frame offset.
///
/// # Errors
///
/// Returns an error if encoding, the write, or the sync fails.
pub fn append_frame(backend: &mut dyn StorageBackend, payload: &[u8]) -> StorageResult<u64> {
    let bytes = encode_frame(payload)?;
    let offset = backend.append(&bytes)?;
    backend.sync()?;
    Ok(offset)
}

/// Decodes every frame in the backend.
///
/// An incomplete or checksum-failing frame that runs to the end of the
/// data is reported through `torn_tail`. Anything wrong earlier is
/// [`StorageError::CorruptFrame`].
///
/// # Errors
///
/// Returns an error if the backend cannot be read or a frame before the
/// tail is damaged.
pub fn scan_frames(backend: &dyn StorageBackend) -> StorageResult<FrameScan> {
    let data = backend.read_all()?;
    let mut scan = FrameScan::default();
    let mut pos = 0usize;

    while pos < data.len() {
        let rest = &data[pos..];
        if rest.len() < HEADER_LEN {
            scan.torn_tail = true;
            break;
        }
        if rest[..4] != FRAME_MAGIC {
            return Err(StorageError::CorruptFrame {
                offset: pos as u64,
                reason: "bad magic".into(),
            });
        }
        let len = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let total = HEADER_LEN + len + CHECKSUM_LEN;
        if rest.len() < total {
            scan.torn_tail = true;
            break;
        }
        let payload = &rest[HEADER_LEN..HEADER_LEN + len];
        let stored = &rest[HEADER_LEN + len..total];
        if stored != checksum(payload) {
            if pos + total == data.len() {
                scan.torn_tail = true;
                break;
            }
            return Err(StorageError::CorruptFrame {
                offset: pos as u64,
                reason: "checksum mismatch".into(),
            });
        }
        scan.frames.push(Frame {
            offset: pos as u64,
            payload: payload.to_vec(),
        });
        pos += total;
    }

    scan.valid_len = pos as u64;
    Ok(scan)
}

/// Scans the backend and cuts off a torn trailing frame if there is one.
///
/// # Errors
///
/// Same as [`scan_frames`], plus truncation failures.
pub fn recover(backend: &mut dyn StorageBackend) -> StorageResult<FrameScan> {
    let scan = scan_frames(backend)?;
    if scan.torn_tail {
        backend.truncate(scan.valid_len)?;
    }
    Ok(scan)
}
