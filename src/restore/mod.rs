//! restore: rebuild per-group stores from a backup chain.
//!
//! Offline restore writes a brand-new tree:
//!   <dest>/p<groupId>/{GROUP_ID, data.bin, LOCK}
//! one directory per group found in the resolved chain. Each group replays
//! independently on its own worker; for every manifest, in backupNum order:
//!   pass 1: apply the manifest's drop markers (reconcile::apply_all), then
//!           prune predicates outside the manifest's predicate set;
//!   pass 2: load the manifest's blob, keeping each record's commit ts.
//! The manifest's predicate set is authoritative: records of other predicates
//! are skipped (types always pass), so a tablet that moved away and back is
//! rebuilt only from what its current owner carried.
//!
//! Everything that can be checked without writing (chain shape, blobs, key,
//! incrementalFrom) is checked first. Any group failure leaves
//! `<dest>/RESTORE_FAILED` behind; such a tree must be discarded.
//!
//! A successful restore records where it stopped (`<dest>/RESTORE_POINT`,
//! or the cluster's restore point online). incrementalFrom=k only runs on
//! top of a state whose restore point is entry k-1 of the same chain.
//!
//! The online variant (restore into a live Cluster) lives in `online`.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::thread;

use crate::backup::decode_group_blob;
use crate::blob::BlobStore;
use crate::chain::{self, RestoreTarget};
use crate::config::BackupConfig;
use crate::crypto::EncryptionKey;
use crate::error::BackupError;
use crate::manifest::{check_blobs, load_chain, Manifest, MasterManifest};
use crate::metrics::{record_restore_completed, record_restore_failed, record_restore_records};
use crate::store::{read_group_id, GroupState, MvccStore};
use crate::util::group_dir_name;

pub mod online;
pub mod reconcile;

pub use online::{run_online_restore, wait_for_restore};

/// Marker left in a destination whose restore failed.
pub const RESTORE_FAILED_FILE: &str = "RESTORE_FAILED";

/// Where a successful offline restore stopped.
pub const RESTORE_POINT_FILE: &str = "RESTORE_POINT";

/// The chain entry a restored state corresponds to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RestorePoint {
    pub backup_id: String,
    pub backup_num: u64,
    pub read_ts: u64,
}

impl RestorePoint {
    pub fn of(m: &MasterManifest) -> Self {
        Self {
            backup_id: m.backup_id.clone(),
            backup_num: m.backup_num,
            read_ts: m.read_ts,
        }
    }
}

/// incrementalFrom=k needs the existing state to sit exactly at entry k-1.
pub(crate) fn check_restore_point(
    found: Option<&RestorePoint>,
    series: &[MasterManifest],
    k: u64,
) -> Result<()> {
    let expected = series
        .iter()
        .find(|m| m.backup_num + 1 == k)
        .ok_or_else(|| anyhow!("chain has no backup {}", k.saturating_sub(1)))?;
    let found = match found {
        Some(p) => p,
        None => {
            return Err(BackupError::RestoreVerificationFailed(format!(
                "incrementalFrom={} needs a state restored to {}.{}, none is recorded",
                k, expected.backup_id, expected.backup_num
            ))
            .into())
        }
    };
    if found.backup_id != expected.backup_id {
        return Err(BackupError::RestoreVerificationFailed(format!(
            "existing state comes from backup {}, incrementalFrom={} continues {}",
            found.backup_id, k, expected.backup_id
        ))
        .into());
    }
    if found.backup_num != expected.backup_num || found.read_ts != expected.read_ts {
        warn!(
            "restore: incrementalFrom={} on a state at {}.{} (read_ts={})",
            k, found.backup_id, found.backup_num, found.read_ts
        );
        return Err(BackupError::BrokenChain {
            expected: expected.backup_num,
            found: found.backup_num,
        }
        .into());
    }
    Ok(())
}

pub fn read_restore_point(dest: &Path) -> Result<Option<RestorePoint>> {
    let path = dest.join(RESTORE_POINT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let p = serde_json::from_slice(&bytes).with_context(|| format!("decode {}", path.display()))?;
    Ok(Some(p))
}

fn write_restore_point(dest: &Path, point: &RestorePoint) -> Result<()> {
    let path = dest.join(RESTORE_POINT_FILE);
    let bytes = serde_json::to_vec_pretty(point)?;
    fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Key for an encrypted chain.
    pub key: Option<EncryptionKey>,
    /// Replay only entries with backupNum >= this on top of an existing restore.
    pub incremental_from: Option<u64>,
}

impl RestoreOptions {
    pub fn with_key(mut self, key: EncryptionKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_incremental_from(mut self, k: u64) -> Self {
        self.incremental_from = Some(k);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRestoreResult {
    pub group_id: u32,
    /// Highest commit ts present after replay.
    pub max_ts: u64,
    pub predicates: BTreeSet<String>,
    pub records_applied: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub backup_id: String,
    pub backup_num: u64,
    pub read_ts: u64,
    pub max_ts: u64,
    pub groups: Vec<GroupRestoreResult>,
}

/// What one group replays.
#[derive(Debug, Clone, Default)]
pub(crate) struct GroupPlan {
    pub(crate) group_id: u32,
    /// Manifests to replay, ascending backupNum.
    pub(crate) manifests: Vec<Manifest>,
    /// Predicates of the latest manifest listing the group.
    pub(crate) assigned: BTreeSet<String>,
}

pub(crate) struct Resolved {
    pub(crate) series: Vec<MasterManifest>,
    pub(crate) plans: BTreeMap<u32, GroupPlan>,
}

impl Resolved {
    fn last(&self) -> Result<&MasterManifest> {
        self.series
            .last()
            .ok_or_else(|| anyhow!("resolved chain is empty"))
    }
}

/// Load, resolve and pre-validate everything a restore needs.
pub(crate) fn prepare(
    blob: &dyn BlobStore,
    target: &RestoreTarget,
    opts: &RestoreOptions,
    cfg: &BackupConfig,
) -> Result<Resolved> {
    let chain = load_chain(blob)?;
    let series = chain::resolve(&chain, target)?;
    if cfg.verify_blobs {
        check_blobs(blob, &series)?;
    }
    chain::verify_key(&series, opts.key.as_ref())?;

    let last_num = series.last().map(|m| m.backup_num).unwrap_or(0);
    if let Some(k) = opts.incremental_from {
        if k < 2 || k > last_num {
            warn!(
                "restore: incrementalFrom={} outside 2..={} for this chain",
                k, last_num
            );
            return Err(BackupError::InvalidBackupNum(k as i64).into());
        }
    }

    let plans = plan_groups(&series, opts.incremental_from);
    Ok(Resolved { series, plans })
}

pub(crate) fn plan_groups(series: &[MasterManifest], from: Option<u64>) -> BTreeMap<u32, GroupPlan> {
    let mut plans: BTreeMap<u32, GroupPlan> = BTreeMap::new();
    for master in series {
        for (gid, m) in &master.manifests {
            let plan = plans.entry(*gid).or_insert_with(|| GroupPlan {
                group_id: *gid,
                ..Default::default()
            });
            plan.assigned = m.predicates.clone();
            if from.map_or(true, |k| m.backup_num >= k) {
                plan.manifests.push(m.clone());
            }
        }
    }
    plans
}

/// Replay one group's manifests onto `base`.
pub(crate) fn replay_group(
    blob: &dyn BlobStore,
    plan: &GroupPlan,
    base: GroupState,
    key: Option<&EncryptionKey>,
) -> Result<(GroupState, usize)> {
    let mut state = base;
    let mut applied = 0usize;
    for m in &plan.manifests {
        state = reconcile::apply_all(state, &m.drop_operations);
        let moved_out = reconcile::retain_assigned(&mut state, &m.predicates);
        if !moved_out.is_empty() {
            debug!(
                "restore: group {} backup {} no longer owns {:?}",
                plan.group_id, m.backup_num, moved_out
            );
        }

        let bytes = blob
            .get(&m.path)?
            .ok_or_else(|| anyhow!("group {} blob {} is missing", plan.group_id, m.path))?;
        let (header, records) = decode_group_blob(&bytes, m.encrypted, key, &m.path)?;
        if header.group_id != m.group_id || header.read_ts != m.read_ts {
            return Err(BackupError::RestoreVerificationFailed(format!(
                "blob {} holds group {} at {}, manifest declares group {} at {}",
                m.path, header.group_id, header.read_ts, m.group_id, m.read_ts
            ))
            .into());
        }

        let mut n = 0usize;
        for r in records {
            let keep = match r.key.predicate() {
                Some(p) => m.predicates.contains(p),
                None => true,
            };
            if keep {
                state.apply(r);
                n += 1;
            }
        }
        record_restore_records(n);
        applied += n;
        debug!(
            "restore: group {} applied backup {}, drops={}, records={}",
            plan.group_id,
            m.backup_num,
            m.drop_operations.len(),
            n
        );
    }

    // with incrementalFrom the group may have no manifest left to replay
    reconcile::retain_assigned(&mut state, &plan.assigned);
    Ok((state, applied))
}

fn group_result(gid: u32, state: &GroupState, applied: usize) -> GroupRestoreResult {
    GroupRestoreResult {
        group_id: gid,
        max_ts: state.max_ts(),
        predicates: state.predicates(u64::MAX),
        records_applied: applied,
    }
}

/// Restore a chain into a fresh directory tree (or, with incrementalFrom, on
/// top of a tree an earlier restore produced).
pub fn run_offline_restore(
    blob: &dyn BlobStore,
    dest: &Path,
    target: &RestoreTarget,
    opts: &RestoreOptions,
    cfg: &BackupConfig,
) -> Result<RestoreSummary> {
    let resolved = prepare(blob, target, opts, cfg)?;
    let last = resolved.last()?;

    info!(
        "restore: start, location={}, dest={}, id={}, num={}, read_ts={}, groups={}, incremental_from={:?}",
        blob.location(),
        dest.display(),
        last.backup_id,
        last.backup_num,
        last.read_ts,
        resolved.plans.len(),
        opts.incremental_from
    );

    check_destination(dest, opts.incremental_from.is_some())?;
    if let Some(k) = opts.incremental_from {
        check_restore_point(read_restore_point(dest)?.as_ref(), &resolved.series, k)?;
    }
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;

    let key = opts.key.as_ref();
    let incremental = opts.incremental_from.is_some();
    let results: Vec<(u32, Result<GroupRestoreResult>)> = thread::scope(|s| {
        let handles: Vec<_> = resolved
            .plans
            .values()
            .map(|plan| {
                let h = s.spawn(move || restore_group_dir(blob, dest, plan, key, incremental));
                (plan.group_id, h)
            })
            .collect();
        handles
            .into_iter()
            .map(|(gid, h)| {
                let r = match h.join() {
                    Ok(r) => r,
                    Err(_) => Err(anyhow!("group {} restore worker panicked", gid)),
                };
                (gid, r)
            })
            .collect()
    });

    let mut groups = Vec::with_capacity(results.len());
    let mut failures: Vec<(u32, anyhow::Error)> = Vec::new();
    for (gid, r) in results {
        match r {
            Ok(g) => groups.push(g),
            Err(e) => failures.push((gid, e)),
        }
    }

    if !failures.is_empty() {
        record_restore_failed();
        let mut report = String::new();
        for (gid, e) in &failures {
            warn!("restore: group {} failed: {:#}", gid, e);
            report.push_str(&format!("group {}: {:#}\n", gid, e));
        }
        let marker = dest.join(RESTORE_FAILED_FILE);
        if let Err(e) = fs::write(&marker, report) {
            warn!("restore: cannot write {}: {}", marker.display(), e);
        }
        let (gid, err) = failures.remove(0);
        return Err(err.context(format!(
            "restore into {} failed at group {}; discard the directory",
            dest.display(),
            gid
        )));
    }

    write_restore_point(dest, &RestorePoint::of(last))?;

    let summary = RestoreSummary {
        backup_id: last.backup_id.clone(),
        backup_num: last.backup_num,
        read_ts: last.read_ts,
        max_ts: groups.iter().map(|g| g.max_ts).max().unwrap_or(0),
        groups,
    };
    record_restore_completed();
    info!(
        "restore: done, dest={}, groups={}, max_ts={}",
        dest.display(),
        summary.groups.len(),
        summary.max_ts
    );
    Ok(summary)
}

fn check_destination(dest: &Path, incremental: bool) -> Result<()> {
    if dest.join(RESTORE_FAILED_FILE).exists() {
        return Err(anyhow!(
            "{} holds a failed restore ({} present); use a clean directory",
            dest.display(),
            RESTORE_FAILED_FILE
        ));
    }
    if incremental || !dest.exists() {
        return Ok(());
    }
    let mut entries = fs::read_dir(dest).with_context(|| format!("read_dir {}", dest.display()))?;
    if entries.next().is_some() {
        return Err(anyhow!(
            "restore destination {} is not empty",
            dest.display()
        ));
    }
    Ok(())
}

fn restore_group_dir(
    blob: &dyn BlobStore,
    dest: &Path,
    plan: &GroupPlan,
    key: Option<&EncryptionKey>,
    incremental: bool,
) -> Result<GroupRestoreResult> {
    let gid = plan.group_id;
    let dir = dest.join(group_dir_name(gid));

    let mut store = if incremental {
        let store = MvccStore::open(&dir)
            .with_context(|| format!("open existing group {} at {}", gid, dir.display()))?;
        if store.group_id() != gid {
            return Err(BackupError::RestoreVerificationFailed(format!(
                "{} is tagged group {}, expected {}",
                dir.display(),
                store.group_id(),
                gid
            ))
            .into());
        }
        store
    } else {
        MvccStore::create(&dir, gid)?
    };

    let base = store.take_state();
    let (state, applied) = replay_group(blob, plan, base, key)?;
    let result = group_result(gid, &state, applied);
    store.replace_state(state);
    store.flush()?;
    drop(store);

    let on_disk = read_group_id(&dir)?;
    if on_disk != gid {
        return Err(BackupError::RestoreVerificationFailed(format!(
            "{} reads back group {}, manifest declares {}",
            dir.display(),
            on_disk,
            gid
        ))
        .into());
    }
    debug!(
        "restore: group {} done at {}, max_ts={}, predicates={}",
        gid,
        dir.display(),
        result.max_ts,
        result.predicates.len()
    );
    Ok(result)
}
