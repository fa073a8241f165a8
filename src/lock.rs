//! Locks used by backup and restore.
//!
//! Two kinds:
//! - StoreLock: fs2 advisory exclusive lock on <store_dir>/LOCK, held for the
//!   lifetime of an open MvccStore so two replays never write one group directory.
//! - BackupSlot: in-process registry of backup locations with an event in flight.
//!   A second backup for the same location fails with BackupInProgress.
//!
//! Both are released on Drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use crate::error::BackupError;

pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // unlock errors on drop are not actionable
        let _ = self.file.unlock();
    }
}

fn lock_file_path(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

/// Take the exclusive lock of a store directory without blocking.
pub fn try_lock_store(dir: &Path) -> Result<StoreLock> {
    let path = lock_file_path(dir);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))?;
    file.try_lock_exclusive()
        .with_context(|| format!("store {} is locked by another writer", dir.display()))?;
    Ok(StoreLock { file, path })
}

fn in_flight() -> &'static Mutex<HashSet<String>> {
    static SLOTS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    SLOTS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Marks one backup location as busy until dropped.
#[derive(Debug)]
pub struct BackupSlot {
    location: String,
}

impl BackupSlot {
    pub fn location(&self) -> &str {
        &self.location
    }
}

impl Drop for BackupSlot {
    fn drop(&mut self) {
        let mut slots = match in_flight().lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.remove(&self.location);
    }
}

/// Claim the backup slot of a location; a concurrent claim gets BackupInProgress.
pub fn try_acquire_backup_slot(location: &str) -> Result<BackupSlot> {
    let mut slots = match in_flight().lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    if !slots.insert(location.to_string()) {
        return Err(BackupError::BackupInProgress(location.to_string()).into());
    }
    Ok(BackupSlot {
        location: location.to_string(),
    })
}
