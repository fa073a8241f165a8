//! backup: one backup event, start to commit.
//!
//! Flow:
//! 1) claim the location's backup slot (a second concurrent event fails with BackupInProgress);
//! 2) read the root manifest log and pick FULL or INCREMENTAL;
//! 3) capture a read ts and every group's window from the cluster (refused while draining);
//! 4) write one blob per group, one worker per group, and join them all;
//! 5) only if every group succeeded, append the MasterManifest to the log (one put).
//!
//! A failed group aborts the event: no log entry is written and the blobs
//! already written stay orphaned under the event directory, never referenced.
//!
//! Layout: `<backupId>.<backupNum:04>/r<readTs>-g<groupId>.backup`, plus the
//! root `manifest.json`.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::thread;

use crate::blob::BlobStore;
use crate::cluster::{Cluster, GroupChanges};
use crate::config::BackupConfig;
use crate::crypto::EncryptionKey;
use crate::error::BackupError;
use crate::lock::try_acquire_backup_slot;
use crate::manifest::{read_manifest_log, write_manifest_log, BackupType, Manifest, MasterManifest};
use crate::metrics::{record_backup_aborted, record_backup_committed, record_backup_started, record_group_blob};
use crate::store::codec::BlobHeader;
use crate::util::{event_dir_name, group_blob_name, new_backup_id};

pub mod stream;

pub use stream::{decode_group_blob, encode_group_blob};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupRequest {
    /// Start a new chain even if one exists at the location.
    pub force_full: bool,
}

impl BackupRequest {
    pub fn full() -> Self {
        Self { force_full: true }
    }
}

/// Run one backup event and return its committed MasterManifest.
pub fn run_backup(
    cluster: &Cluster,
    blob: &dyn BlobStore,
    req: &BackupRequest,
    cfg: &BackupConfig,
) -> Result<MasterManifest> {
    let location = blob.location();
    let _slot = try_acquire_backup_slot(&location)?;
    record_backup_started();

    match run_backup_locked(cluster, blob, req, cfg) {
        Ok(m) => {
            record_backup_committed();
            Ok(m)
        }
        Err(e) => {
            record_backup_aborted();
            warn!("backup: aborted, location={}, err={:#}", location, e);
            Err(e)
        }
    }
}

fn run_backup_locked(
    cluster: &Cluster,
    blob: &dyn BlobStore,
    req: &BackupRequest,
    cfg: &BackupConfig,
) -> Result<MasterManifest> {
    let key = match cfg.encryption_key_file.as_deref() {
        Some(p) => Some(EncryptionKey::from_file(p)?),
        None => None,
    };
    let checksum = key.as_ref().map(|k| k.checksum_hex());

    let mut log = read_manifest_log(blob)?;
    let prev = log.latest().cloned();

    let continue_from = match &prev {
        Some(p) if req.force_full => {
            debug!("backup: forced full, previous chain {} ends at {}", p.backup_id, p.backup_num);
            None
        }
        Some(p) if p.encryption_key_checksum != checksum => {
            info!(
                "backup: encryption key changed since {}.{}, starting a new chain",
                p.backup_id, p.backup_num
            );
            None
        }
        other => other.as_ref(),
    };

    let since = continue_from.map(|p| p.read_ts);
    let (read_ts, changes) = cluster.capture(since)?;

    let (backup_id, backup_num, backup_type) = match continue_from {
        Some(p) => (p.backup_id.clone(), p.backup_num + 1, BackupType::Incremental),
        None => (new_backup_id(read_ts), 1, BackupType::Full),
    };
    let since = since.unwrap_or(0);
    let dir = event_dir_name(&backup_id, backup_num);

    info!(
        "backup: start, location={}, id={}, num={}, type={}, since={}, read_ts={}, groups={}",
        blob.location(),
        backup_id,
        backup_num,
        backup_type.as_str(),
        since,
        read_ts,
        changes.len()
    );

    let template = Manifest {
        backup_num,
        group_id: 0,
        since,
        read_ts,
        backup_type,
        predicates: Default::default(),
        drop_operations: Vec::new(),
        encrypted: key.is_some(),
        path: String::new(),
    };

    let manifests = write_groups(blob, &dir, changes, &template, key.as_ref(), cfg.compression_level)?;

    let master = MasterManifest {
        backup_id,
        backup_num,
        path: dir,
        since,
        read_ts,
        backup_type,
        encrypted: key.is_some(),
        encryption_key_checksum: checksum,
        manifests,
    };
    master.check()?;

    log.push(master.clone());
    write_manifest_log(blob, &log)
        .with_context(|| format!("commit backup {}.{}", master.backup_id, master.backup_num))?;
    cluster.backup_committed(&blob.location(), master.read_ts);

    info!(
        "backup: committed, id={}, num={}, read_ts={}, groups={}",
        master.backup_id,
        master.backup_num,
        master.read_ts,
        master.manifests.len()
    );
    Ok(master)
}

/// One worker per group; every handle is joined before anything is returned.
fn write_groups(
    blob: &dyn BlobStore,
    dir: &str,
    changes: BTreeMap<u32, GroupChanges>,
    template: &Manifest,
    key: Option<&EncryptionKey>,
    level: i32,
) -> Result<BTreeMap<u32, Manifest>> {
    let results: Vec<(u32, Result<Manifest>)> = thread::scope(|s| {
        let handles: Vec<_> = changes
            .into_iter()
            .map(|(gid, ch)| {
                let h = s.spawn(move || write_group(blob, dir, gid, ch, template, key, level));
                (gid, h)
            })
            .collect();
        handles
            .into_iter()
            .map(|(gid, h)| {
                let r = match h.join() {
                    Ok(r) => r,
                    Err(_) => Err(anyhow::anyhow!("group {} backup worker panicked", gid)),
                };
                (gid, r)
            })
            .collect()
    });

    let mut out = BTreeMap::new();
    let mut first_err: Option<BackupError> = None;
    for (gid, r) in results {
        match r {
            Ok(m) => {
                out.insert(gid, m);
            }
            Err(e) => {
                warn!("backup: group {} failed: {:#}", gid, e);
                if first_err.is_none() {
                    first_err = Some(BackupError::PartialWriteAborted {
                        group: gid,
                        reason: format!("{:#}", e),
                    });
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e.into()),
        None => Ok(out),
    }
}

fn write_group(
    blob: &dyn BlobStore,
    dir: &str,
    gid: u32,
    changes: GroupChanges,
    template: &Manifest,
    key: Option<&EncryptionKey>,
    level: i32,
) -> Result<Manifest> {
    let path = format!("{}/{}", dir, group_blob_name(template.read_ts, gid));
    let header = BlobHeader {
        group_id: gid,
        read_ts: template.read_ts,
    };
    let bytes = encode_group_blob(header, &changes.records, level, key, &path)?;
    blob.put(&path, &bytes)
        .with_context(|| format!("write group {} blob {}", gid, path))?;
    record_group_blob(changes.records.len(), bytes.len());

    debug!(
        "backup: group {} wrote {}, records={}, bytes={}, drops={}, predicates={}",
        gid,
        path,
        changes.records.len(),
        bytes.len(),
        changes.drops.len(),
        changes.predicates.len()
    );

    Ok(Manifest {
        group_id: gid,
        predicates: changes.predicates,
        drop_operations: changes.drops,
        path,
        ..template.clone()
    })
}
