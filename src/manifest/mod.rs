//! manifest: what one backup event recorded.
//!
//! - Manifest: one group's contribution (window, predicates, drop markers, blob path).
//! - MasterManifest: the commit record of one event, all group manifests together.
//! - ManifestLog: the root `manifest.json` of a backup location, every committed
//!   MasterManifest in commit order.
//!
//! JSON uses camelCase field names; the backup kind is stored under "type"
//! as FULL/INCREMENTAL. Decoding validates what serde cannot express and
//! reports it as `CorruptManifest`.
//!
//! Blob I/O lives in `manifest::io`; everything here is pure.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::BackupError;

pub mod io;

pub use io::{check_blobs, load_chain, read_manifest_log, write_manifest_log, MANIFEST_FILE};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupType {
    Full,
    Incremental,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "FULL",
            BackupType::Incremental => "INCREMENTAL",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DropKind {
    All,
    Data,
    Attr,
}

/// A drop that happened inside a manifest's (since, readTs] window.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DropRecord {
    pub kind: DropKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
}

impl DropRecord {
    pub fn all() -> Self {
        Self { kind: DropKind::All, predicate: None }
    }

    pub fn data() -> Self {
        Self { kind: DropKind::Data, predicate: None }
    }

    pub fn attr<S: Into<String>>(predicate: S) -> Self {
        Self { kind: DropKind::Attr, predicate: Some(predicate.into()) }
    }

    /// ATTR needs a predicate; ALL/DATA must not carry one.
    pub fn check(&self) -> std::result::Result<(), BackupError> {
        match (self.kind, self.predicate.as_deref()) {
            (DropKind::Attr, Some(p)) if !p.is_empty() => Ok(()),
            (DropKind::Attr, _) => Err(BackupError::CorruptManifest(
                "ATTR drop operation without a predicate".into(),
            )),
            (_, Some(p)) => Err(BackupError::CorruptManifest(format!(
                "{:?} drop operation must not name a predicate (got '{}')",
                self.kind, p
            ))),
            (_, None) => Ok(()),
        }
    }
}

/// One group's part of one backup event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub backup_num: u64,
    pub group_id: u32,
    pub since: u64,
    pub read_ts: u64,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub predicates: BTreeSet<String>,
    #[serde(default)]
    pub drop_operations: Vec<DropRecord>,
    pub encrypted: bool,
    /// Group blob, relative to the backup location.
    pub path: String,
}

impl Manifest {
    pub fn check(&self) -> std::result::Result<(), BackupError> {
        if self.backup_num < 1 {
            return Err(BackupError::CorruptManifest(format!(
                "group {}: backupNum must be >= 1, got {}",
                self.group_id, self.backup_num
            )));
        }
        if self.read_ts < self.since {
            return Err(BackupError::CorruptManifest(format!(
                "group {}: readTs {} is before since {}",
                self.group_id, self.read_ts, self.since
            )));
        }
        if self.path.is_empty() {
            return Err(BackupError::CorruptManifest(format!(
                "group {}: empty blob path",
                self.group_id
            )));
        }
        for d in &self.drop_operations {
            d.check()?;
        }
        Ok(())
    }
}

/// Commit record of one backup event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MasterManifest {
    pub backup_id: String,
    pub backup_num: u64,
    /// Event directory, relative to the backup location.
    pub path: String,
    pub since: u64,
    pub read_ts: u64,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_checksum: Option<String>,
    pub manifests: BTreeMap<u32, Manifest>,
}

impl MasterManifest {
    pub fn check(&self) -> std::result::Result<(), BackupError> {
        if self.backup_id.is_empty() {
            return Err(BackupError::CorruptManifest("empty backupId".into()));
        }
        if self.backup_num < 1 {
            return Err(BackupError::CorruptManifest(format!(
                "{}: backupNum must be >= 1, got {}",
                self.backup_id, self.backup_num
            )));
        }
        if self.encrypted != self.encryption_key_checksum.is_some() {
            return Err(BackupError::CorruptManifest(format!(
                "{}.{}: encrypted={} but key checksum present={}",
                self.backup_id,
                self.backup_num,
                self.encrypted,
                self.encryption_key_checksum.is_some()
            )));
        }
        for (gid, m) in &self.manifests {
            m.check()?;
            if m.group_id != *gid {
                return Err(BackupError::CorruptManifest(format!(
                    "{}.{}: manifest under group {} declares group {}",
                    self.backup_id, self.backup_num, gid, m.group_id
                )));
            }
            if m.backup_num != self.backup_num
                || m.since != self.since
                || m.read_ts != self.read_ts
                || m.backup_type != self.backup_type
                || m.encrypted != self.encrypted
            {
                return Err(BackupError::CorruptManifest(format!(
                    "{}.{}: group {} manifest disagrees with its master",
                    self.backup_id, self.backup_num, gid
                )));
            }
        }
        Ok(())
    }

    pub fn group_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.manifests.keys().copied()
    }
}

/// Root manifest.json of a backup location.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestLog {
    pub manifests: Vec<MasterManifest>,
}

impl ManifestLog {
    pub fn latest(&self) -> Option<&MasterManifest> {
        self.manifests.last()
    }

    pub fn push(&mut self, m: MasterManifest) {
        self.manifests.push(m);
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }
}

fn corrupt(e: serde_json::Error) -> anyhow::Error {
    BackupError::CorruptManifest(e.to_string()).into()
}

pub fn decode_manifest(bytes: &[u8]) -> Result<Manifest> {
    let m: Manifest = serde_json::from_slice(bytes).map_err(corrupt)?;
    m.check()?;
    Ok(m)
}

pub fn decode_master(bytes: &[u8]) -> Result<MasterManifest> {
    let m: MasterManifest = serde_json::from_slice(bytes).map_err(corrupt)?;
    m.check()?;
    Ok(m)
}

pub fn decode_log(bytes: &[u8]) -> Result<ManifestLog> {
    let log: ManifestLog = serde_json::from_slice(bytes).map_err(corrupt)?;
    for m in &log.manifests {
        m.check()?;
    }
    Ok(log)
}

pub fn encode_master(m: &MasterManifest) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(m)?)
}

pub fn encode_log(log: &ManifestLog) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(log)?)
}
