use anyhow::Result;
use std::path::PathBuf;

use shardvault::chain::RestoreTarget;
use shardvault::crypto::EncryptionKey;
use shardvault::error::BackupError;

pub fn load_key(path: Option<PathBuf>) -> Result<Option<EncryptionKey>> {
    match path {
        Some(p) => Ok(Some(EncryptionKey::from_file(&p)?)),
        None => Ok(None),
    }
}

/// An omitted --backup-num means latest; an explicit value must be >= 1.
pub fn target_from_args(
    backup_id: Option<String>,
    backup_num: Option<i64>,
    commit_ts: Option<u64>,
) -> Result<RestoreTarget> {
    let t = match (commit_ts, backup_num) {
        (Some(ts), _) => RestoreTarget::commit_ts(ts),
        (None, Some(n)) if n < 1 => return Err(BackupError::InvalidBackupNum(n).into()),
        (None, n) => RestoreTarget::backup_num(n.unwrap_or(0)),
    };
    Ok(match backup_id {
        Some(id) => t.with_backup_id(id),
        None => t,
    })
}

pub fn display_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => format!("(binary {} B)", bytes.len()),
    }
}
