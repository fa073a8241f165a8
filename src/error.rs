//! Typed failures of the backup/restore subsystem.
//!
//! Everything else in the crate returns `anyhow::Result`; these variants ride
//! inside `anyhow::Error` and are recovered with `classify()` (or
//! `downcast_ref::<BackupError>()`) by callers that need to branch on them.
//!
//! Validation errors (`EmptyChain`, `BrokenChain`, `MissingBlob`,
//! `InvalidBackupNum`, `NotEnoughBackups`, `EncryptionMismatch`) are raised
//! before anything is written. `DrainingRejected` is the only retryable one.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackupError {
    #[error("corrupt manifest: {0}")]
    CorruptManifest(String),

    #[error("failed to verify backup: no manifests found for {0}")]
    EmptyChain(String),

    #[error("broken backup chain: expected a BackupNum value of {expected}, got {found}")]
    BrokenChain { expected: u64, found: u64 },

    #[error("broken backup chain: backup {backup_num} starts at since={found}, previous readTs is {expected}")]
    BrokenSince { backup_num: u64, expected: u64, found: u64 },

    #[error("broken backup chain: backup {backup_num} is committed but blob {path} is missing")]
    MissingBlob { backup_num: u64, path: String },

    #[error("backupNum value should be equal or greater than zero, got {0}")]
    InvalidBackupNum(i64),

    #[error("not enough backups: requested backupNum {requested}, chain has {available}")]
    NotEnoughBackups { requested: i64, available: usize },

    #[error("encryption mismatch: {0}")]
    EncryptionMismatch(String),

    #[error("backup already in progress for {0}")]
    BackupInProgress(String),

    #[error("restore verification failed: {0}")]
    RestoreVerificationFailed(String),

    #[error("backup aborted, no manifest written: group {group}: {reason}")]
    PartialWriteAborted { group: u32, reason: String },

    #[error("the server is in draining mode, retry later")]
    DrainingRejected,
}

impl BackupError {
    /// Only a read rejected by an online restore in progress is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackupError::DrainingRejected)
    }

    pub fn is_broken_chain(&self) -> bool {
        matches!(
            self,
            BackupError::BrokenChain { .. }
                | BackupError::BrokenSince { .. }
                | BackupError::MissingBlob { .. }
        )
    }
}

/// Find a `BackupError` anywhere in an anyhow chain (context layers included).
pub fn classify(err: &anyhow::Error) -> Option<&BackupError> {
    err.chain().find_map(|e| e.downcast_ref::<BackupError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_sees_through_context() {
        let r: anyhow::Result<()> = Err(BackupError::BrokenChain { expected: 1, found: 2 })
            .context("restore from /tmp/x");
        let err = r.unwrap_err();
        assert_eq!(
            classify(&err),
            Some(&BackupError::BrokenChain { expected: 1, found: 2 })
        );
        assert!(format!("{:#}", err).contains("expected a BackupNum value of 1"));
    }

    #[test]
    fn only_draining_is_retryable() {
        assert!(BackupError::DrainingRejected.is_retryable());
        assert!(!BackupError::BackupInProgress("x".into()).is_retryable());
        assert!(!BackupError::InvalidBackupNum(-1).is_retryable());
    }
}
