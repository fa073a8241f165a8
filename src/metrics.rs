//! Lightweight global metrics for backup/restore.
//!
//! Thread-safe atomic counters, process-wide:
//! - Backup events (started / committed / aborted), group blobs, records and bytes
//! - Restores (completed / failed), records applied
//! - Reconciler activity (drop operations applied, predicates pruned after moves)

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Backup -----
static BACKUPS_STARTED: AtomicU64 = AtomicU64::new(0);
static BACKUPS_COMMITTED: AtomicU64 = AtomicU64::new(0);
static BACKUPS_ABORTED: AtomicU64 = AtomicU64::new(0);
static BACKUP_GROUP_BLOBS: AtomicU64 = AtomicU64::new(0);
static BACKUP_RECORDS_EMITTED: AtomicU64 = AtomicU64::new(0);
static BACKUP_BYTES_EMITTED: AtomicU64 = AtomicU64::new(0);

// ----- Restore -----
static RESTORES_COMPLETED: AtomicU64 = AtomicU64::new(0);
static RESTORES_FAILED: AtomicU64 = AtomicU64::new(0);
static RESTORE_RECORDS_APPLIED: AtomicU64 = AtomicU64::new(0);

// ----- Reconciler -----
static DROP_OPS_APPLIED: AtomicU64 = AtomicU64::new(0);
static PREDICATES_PRUNED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub backups_started: u64,
    pub backups_committed: u64,
    pub backups_aborted: u64,
    pub backup_group_blobs: u64,
    pub backup_records_emitted: u64,
    pub backup_bytes_emitted: u64,

    pub restores_completed: u64,
    pub restores_failed: u64,
    pub restore_records_applied: u64,

    pub drop_ops_applied: u64,
    pub predicates_pruned: u64,
}

impl MetricsSnapshot {
    /// Average compressed blob size per group blob written.
    pub fn avg_blob_bytes(&self) -> f64 {
        if self.backup_group_blobs == 0 {
            0.0
        } else {
            self.backup_bytes_emitted as f64 / self.backup_group_blobs as f64
        }
    }
}

// ----- Recorders (Backup) -----
pub fn record_backup_started() {
    BACKUPS_STARTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_backup_committed() {
    BACKUPS_COMMITTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_backup_aborted() {
    BACKUPS_ABORTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_group_blob(records: usize, bytes: usize) {
    BACKUP_GROUP_BLOBS.fetch_add(1, Ordering::Relaxed);
    BACKUP_RECORDS_EMITTED.fetch_add(records as u64, Ordering::Relaxed);
    BACKUP_BYTES_EMITTED.fetch_add(bytes as u64, Ordering::Relaxed);
}

// ----- Recorders (Restore) -----
pub fn record_restore_completed() {
    RESTORES_COMPLETED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_restore_failed() {
    RESTORES_FAILED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_restore_records(n: usize) {
    RESTORE_RECORDS_APPLIED.fetch_add(n as u64, Ordering::Relaxed);
}

// ----- Recorders (Reconciler) -----
pub fn record_drop_op_applied() {
    DROP_OPS_APPLIED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_predicates_pruned(n: usize) {
    PREDICATES_PRUNED.fetch_add(n as u64, Ordering::Relaxed);
}

// ----- Snapshot / Reset -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        backups_started: BACKUPS_STARTED.load(Ordering::Relaxed),
        backups_committed: BACKUPS_COMMITTED.load(Ordering::Relaxed),
        backups_aborted: BACKUPS_ABORTED.load(Ordering::Relaxed),
        backup_group_blobs: BACKUP_GROUP_BLOBS.load(Ordering::Relaxed),
        backup_records_emitted: BACKUP_RECORDS_EMITTED.load(Ordering::Relaxed),
        backup_bytes_emitted: BACKUP_BYTES_EMITTED.load(Ordering::Relaxed),

        restores_completed: RESTORES_COMPLETED.load(Ordering::Relaxed),
        restores_failed: RESTORES_FAILED.load(Ordering::Relaxed),
        restore_records_applied: RESTORE_RECORDS_APPLIED.load(Ordering::Relaxed),

        drop_ops_applied: DROP_OPS_APPLIED.load(Ordering::Relaxed),
        predicates_pruned: PREDICATES_PRUNED.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    BACKUPS_STARTED.store(0, Ordering::Relaxed);
    BACKUPS_COMMITTED.store(0, Ordering::Relaxed);
    BACKUPS_ABORTED.store(0, Ordering::Relaxed);
    BACKUP_GROUP_BLOBS.store(0, Ordering::Relaxed);
    BACKUP_RECORDS_EMITTED.store(0, Ordering::Relaxed);
    BACKUP_BYTES_EMITTED.store(0, Ordering::Relaxed);

    RESTORES_COMPLETED.store(0, Ordering::Relaxed);
    RESTORES_FAILED.store(0, Ordering::Relaxed);
    RESTORE_RECORDS_APPLIED.store(0, Ordering::Relaxed);

    DROP_OPS_APPLIED.store(0, Ordering::Relaxed);
    PREDICATES_PRUNED.store(0, Ordering::Relaxed);
}
