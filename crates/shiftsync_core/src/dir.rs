//! Replica directory management.
//!
//! Layout of a replica on disk:
//!
//! ```text
//! <replica_path>/
//! ├─ LOCK              # Advisory lock for single-writer
//! ├─ oplog.journal     # Op-log journal
//! └─ clock.state       # Causal clock frames
//! ```
//!
//! The LOCK file makes sure only one process appends to the op-log and
//! advances the clock at a time.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "oplog.journal";
const CLOCK_FILE: &str = "clock.state";

/// An opened replica directory. Holds the exclusive lock until dropped.
#[derive(Debug)]
pub struct ReplicaDir {
    path: PathBuf,
    _lock_file: File,
}

impl ReplicaDir {
    /// Opens or creates a replica directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `ReplicaLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_operation(format!(
                    "replica directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_operation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::ReplicaLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Path of the directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the op-log journal.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.path.join(JOURNAL_FILE)
    }

    /// Path of the clock state.
    #[must_use]
    pub fn clock_path(&self) -> PathBuf {
        self.path.join(CLOCK_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_and_locks() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("replica");
        let dir = ReplicaDir::open(&path, true).unwrap();
        assert!(path.join(LOCK_FILE).exists());
        assert_eq!(dir.journal_path(), path.join("oplog.journal"));

        let err = ReplicaDir::open(&path, true).unwrap_err();
        assert!(matches!(err, CoreError::ReplicaLocked));

        drop(dir);
        assert!(ReplicaDir::open(&path, false).is_ok());
    }

    #[test]
    fn missing_dir_without_create_fails() {
        let tmp = tempdir().unwrap();
        let err = ReplicaDir::open(&tmp.path().join("nope"), false).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }
}
