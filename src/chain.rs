//! chain: turns a location's committed manifests into the exact sequence to replay.
//!
//! A chain is all MasterManifests sharing one backupId, ordered by backupNum.
//! It is valid when it starts with a FULL backup numbered 1, numbers are
//! contiguous, each entry's `since` (master and every group) equals the
//! previous entry's readTs, and all entries agree on encryption.

use anyhow::Result;
use log::{debug, warn};

use crate::crypto::EncryptionKey;
use crate::error::BackupError;
use crate::manifest::{BackupType, MasterManifest};

/// Where a restore should stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTarget {
    /// Replay up to and including `backup_num`; 0 means the latest entry.
    BackupNum {
        backup_id: Option<String>,
        backup_num: i64,
    },
    /// Replay every entry with readTs <= commit_ts.
    CommitTs {
        backup_id: Option<String>,
        commit_ts: u64,
    },
}

impl RestoreTarget {
    pub fn latest() -> Self {
        RestoreTarget::BackupNum { backup_id: None, backup_num: 0 }
    }

    pub fn backup_num(backup_num: i64) -> Self {
        RestoreTarget::BackupNum { backup_id: None, backup_num }
    }

    pub fn commit_ts(commit_ts: u64) -> Self {
        RestoreTarget::CommitTs { backup_id: None, commit_ts }
    }

    pub fn with_backup_id<S: Into<String>>(self, id: S) -> Self {
        let id = Some(id.into());
        match self {
            RestoreTarget::BackupNum { backup_num, .. } => {
                RestoreTarget::BackupNum { backup_id: id, backup_num }
            }
            RestoreTarget::CommitTs { commit_ts, .. } => {
                RestoreTarget::CommitTs { backup_id: id, commit_ts }
            }
        }
    }

    pub fn backup_id(&self) -> Option<&str> {
        match self {
            RestoreTarget::BackupNum { backup_id, .. } | RestoreTarget::CommitTs { backup_id, .. } => {
                backup_id.as_deref()
            }
        }
    }
}

/// Pick the series the target names and return its validated replay prefix.
pub fn resolve(chain: &[MasterManifest], target: &RestoreTarget) -> Result<Vec<MasterManifest>> {
    if let RestoreTarget::BackupNum { backup_num, .. } = target {
        if *backup_num < 0 {
            return Err(BackupError::InvalidBackupNum(*backup_num).into());
        }
    }

    let backup_id = match target.backup_id() {
        Some(id) => id.to_string(),
        None => pick_series(chain, target)?,
    };

    let mut series: Vec<MasterManifest> = chain
        .iter()
        .filter(|m| m.backup_id == backup_id)
        .cloned()
        .collect();
    series.sort_by_key(|m| m.backup_num);
    if series.is_empty() {
        return Err(BackupError::EmptyChain(backup_id).into());
    }
    let available = series.len();

    let prefix: Vec<MasterManifest> = match target {
        RestoreTarget::BackupNum { backup_num: 0, .. } => series,
        RestoreTarget::BackupNum { backup_num, .. } => series
            .into_iter()
            .filter(|m| m.backup_num <= *backup_num as u64)
            .collect(),
        RestoreTarget::CommitTs { commit_ts, .. } => series
            .into_iter()
            .filter(|m| m.read_ts <= *commit_ts)
            .collect(),
    };
    if prefix.is_empty() {
        return Err(BackupError::EmptyChain(format!("{} at {:?}", backup_id, target)).into());
    }

    validate(&prefix)?;

    if let RestoreTarget::BackupNum { backup_num, .. } = target {
        if *backup_num as usize > prefix.len() {
            return Err(BackupError::NotEnoughBackups {
                requested: *backup_num,
                available,
            }
            .into());
        }
    }

    debug!(
        "chain: resolved, backup_id={}, entries={}, read_ts={}",
        backup_id,
        prefix.len(),
        prefix.last().map(|m| m.read_ts).unwrap_or(0)
    );
    Ok(prefix)
}

fn pick_series(chain: &[MasterManifest], target: &RestoreTarget) -> Result<String> {
    let picked = match target {
        RestoreTarget::BackupNum { .. } => chain.last(),
        RestoreTarget::CommitTs { commit_ts, .. } => {
            chain.iter().rev().find(|m| m.read_ts <= *commit_ts)
        }
    };
    match picked {
        Some(m) => Ok(m.backup_id.clone()),
        None if chain.is_empty() => Err(BackupError::EmptyChain("this location".into()).into()),
        None => Err(BackupError::EmptyChain(format!("{:?}", target)).into()),
    }
}

/// Linear-history check of an ordered series (see module docs).
pub fn validate(series: &[MasterManifest]) -> Result<()> {
    let first = match series.first() {
        Some(m) => m,
        None => return Err(BackupError::EmptyChain("empty series".into()).into()),
    };
    if first.backup_num != 1 || first.backup_type != BackupType::Full {
        return Err(BackupError::BrokenChain { expected: 1, found: first.backup_num }.into());
    }

    for pair in series.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        if cur.backup_num != prev.backup_num + 1 || cur.backup_type != BackupType::Incremental {
            return Err(BackupError::BrokenChain {
                expected: prev.backup_num + 1,
                found: cur.backup_num,
            }
            .into());
        }
        if cur.since != prev.read_ts {
            return Err(BackupError::BrokenSince {
                backup_num: cur.backup_num,
                expected: prev.read_ts,
                found: cur.since,
            }
            .into());
        }
        if cur.read_ts <= prev.read_ts {
            return Err(BackupError::CorruptManifest(format!(
                "{}.{}: readTs {} does not advance past {}",
                cur.backup_id, cur.backup_num, cur.read_ts, prev.read_ts
            ))
            .into());
        }
        for (gid, m) in &cur.manifests {
            if m.since != prev.read_ts {
                return Err(BackupError::BrokenSince {
                    backup_num: cur.backup_num,
                    expected: prev.read_ts,
                    found: m.since,
                }
                .into());
            }
            debug!("chain: backup {} group {} ok", cur.backup_num, gid);
        }
    }

    for m in series {
        if m.encrypted != first.encrypted || m.encryption_key_checksum != first.encryption_key_checksum {
            return Err(BackupError::EncryptionMismatch(format!(
                "{}.{} is {} but {}.1 is {}",
                m.backup_id,
                m.backup_num,
                describe_encryption(m),
                first.backup_id,
                describe_encryption(first)
            ))
            .into());
        }
    }
    Ok(())
}

fn describe_encryption(m: &MasterManifest) -> String {
    match &m.encryption_key_checksum {
        Some(c) => format!("encrypted (key {})", c.chars().take(12).collect::<String>()),
        None => "unencrypted".to_string(),
    }
}

/// Check the restore key against a resolved chain.
pub fn verify_key(series: &[MasterManifest], key: Option<&EncryptionKey>) -> Result<()> {
    let first = match series.first() {
        Some(m) => m,
        None => return Ok(()),
    };
    match (&first.encryption_key_checksum, key) {
        (Some(_), None) => Err(BackupError::EncryptionMismatch(format!(
            "backup {} is encrypted; an encryption key file is required",
            first.backup_id
        ))
        .into()),
        (Some(expected), Some(k)) => {
            let got = k.checksum_hex();
            if &got != expected {
                return Err(BackupError::EncryptionMismatch(format!(
                    "key checksum {} does not match backup {} (expected {})",
                    got, first.backup_id, expected
                ))
                .into());
            }
            Ok(())
        }
        (None, Some(_)) => {
            warn!(
                "chain: backup {} is not encrypted; ignoring the supplied key",
                first.backup_id
            );
            Ok(())
        }
        (None, None) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use crate::manifest::Manifest;
    use std::collections::{BTreeMap, BTreeSet};

    fn entry(id: &str, num: u64, since: u64, read_ts: u64) -> MasterManifest {
        let backup_type = if num == 1 { BackupType::Full } else { BackupType::Incremental };
        let mut manifests = BTreeMap::new();
        manifests.insert(
            1,
            Manifest {
                backup_num: num,
                group_id: 1,
                since,
                read_ts,
                backup_type,
                predicates: BTreeSet::new(),
                drop_operations: Vec::new(),
                encrypted: false,
                path: format!("{}.{:04}/r{}-g1.backup", id, num, read_ts),
            },
        );
        MasterManifest {
            backup_id: id.into(),
            backup_num: num,
            path: format!("{}.{:04}", id, num),
            since,
            read_ts,
            backup_type,
            encrypted: false,
            encryption_key_checksum: None,
            manifests,
        }
    }

    fn chain3() -> Vec<MasterManifest> {
        vec![entry("a", 1, 0, 10), entry("a", 2, 10, 20), entry("a", 3, 20, 30)]
    }

    fn kind(r: Result<Vec<MasterManifest>>) -> BackupError {
        let err = r.unwrap_err();
        classify(&err).cloned().unwrap()
    }

    #[test]
    fn picks_prefix_by_num_and_ts() {
        let c = chain3();
        assert_eq!(resolve(&c, &RestoreTarget::latest()).unwrap().len(), 3);
        assert_eq!(resolve(&c, &RestoreTarget::backup_num(2)).unwrap().len(), 2);
        assert_eq!(resolve(&c, &RestoreTarget::commit_ts(25)).unwrap().len(), 2);
        assert_eq!(resolve(&c, &RestoreTarget::commit_ts(30)).unwrap().len(), 3);
    }

    #[test]
    fn num_bounds() {
        let c = chain3();
        assert_eq!(
            kind(resolve(&c, &RestoreTarget::backup_num(4))),
            BackupError::NotEnoughBackups { requested: 4, available: 3 }
        );
        assert_eq!(
            kind(resolve(&c, &RestoreTarget::backup_num(-1))),
            BackupError::InvalidBackupNum(-1)
        );
        assert!(matches!(kind(resolve(&[], &RestoreTarget::latest())), BackupError::EmptyChain(_)));
        assert!(matches!(
            kind(resolve(&c, &RestoreTarget::latest().with_backup_id("zzz"))),
            BackupError::EmptyChain(_)
        ));
    }

    #[test]
    fn gaps_are_reported_with_expected_ordinal() {
        let c = vec![entry("a", 2, 10, 20), entry("a", 3, 20, 30)];
        assert_eq!(
            kind(resolve(&c, &RestoreTarget::latest())),
            BackupError::BrokenChain { expected: 1, found: 2 }
        );

        let c = vec![entry("a", 1, 0, 10), entry("a", 3, 20, 30)];
        assert_eq!(
            kind(resolve(&c, &RestoreTarget::latest())),
            BackupError::BrokenChain { expected: 2, found: 3 }
        );

        let c = vec![entry("a", 1, 0, 10), entry("a", 2, 11, 20)];
        assert!(kind(resolve(&c, &RestoreTarget::latest())).is_broken_chain());
    }

    #[test]
    fn mixed_encryption_is_rejected() {
        let mut c = chain3();
        c[1].encrypted = true;
        c[1].encryption_key_checksum = Some("abc".into());
        assert!(matches!(
            kind(resolve(&c, &RestoreTarget::latest())),
            BackupError::EncryptionMismatch(_)
        ));
    }

    #[test]
    fn non_ascii_key_checksum_is_a_mismatch_not_a_panic() {
        let mut c = chain3();
        c[1].encrypted = true;
        c[1].encryption_key_checksum = Some("aaaaaaaaaaa\u{e9}bbbb".into());
        match kind(resolve(&c, &RestoreTarget::latest())) {
            BackupError::EncryptionMismatch(msg) => assert!(msg.contains("aaaaaaaaaaa\u{e9}"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn latest_series_wins_without_id() {
        let mut c = chain3();
        c.push(entry("b", 1, 0, 40));
        let r = resolve(&c, &RestoreTarget::latest()).unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(r[0].backup_id, "b");

        let r = resolve(&c, &RestoreTarget::commit_ts(35)).unwrap();
        assert_eq!(r.len(), 3);
        assert_eq!(r[0].backup_id, "a");
    }
}
