//! restore/online: restore into a running cluster.
//!
//! Validation happens before the cluster is touched. Then the cluster drains
//! (reads, writes and backups fail with DrainingRejected), every group is
//! rebuilt on its own worker, and the new states are installed only once all
//! groups succeeded. Draining starts and ends under the commit lock, and the
//! install, the oracle bump and the new restore point happen while it is
//! held, so no write lands between them. If anything fails after draining
//! started, the cluster stays draining and the error is returned; the
//! operator decides what happens next.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::thread;
use std::time::Duration;

use super::{
    check_restore_point, group_result, prepare, replay_group, GroupPlan, GroupRestoreResult,
    RestoreOptions, RestorePoint, RestoreSummary,
};
use crate::blob::BlobStore;
use crate::chain::RestoreTarget;
use crate::cluster::{Cluster, TimestampOracle};
use crate::config::BackupConfig;
use crate::error::classify;
use crate::metrics::{record_restore_completed, record_restore_failed};
use crate::store::GroupState;

pub fn run_online_restore(
    cluster: &Cluster,
    blob: &dyn BlobStore,
    target: &RestoreTarget,
    opts: &RestoreOptions,
    cfg: &BackupConfig,
) -> Result<RestoreSummary> {
    let resolved = prepare(blob, target, opts, cfg)?;
    let last = resolved
        .series
        .last()
        .ok_or_else(|| anyhow!("resolved chain is empty"))?;

    for gid in resolved.plans.keys() {
        if cluster.group(*gid).is_none() {
            return Err(anyhow!(
                "backup {} has group {} which this cluster does not have",
                last.backup_id,
                gid
            ));
        }
    }

    info!(
        "restore: online start, location={}, id={}, num={}, read_ts={}, incremental_from={:?}",
        blob.location(),
        last.backup_id,
        last.backup_num,
        last.read_ts,
        opts.incremental_from
    );
    {
        let _c = cluster.commit_guard();
        if let Some(k) = opts.incremental_from {
            check_restore_point(cluster.restore_point().as_ref(), &resolved.series, k)?;
        }
        cluster.set_draining(true);
    }

    let incremental = opts.incremental_from.is_some();
    let key = opts.key.as_ref();
    let empty_plan = |gid: u32| GroupPlan {
        group_id: gid,
        ..Default::default()
    };

    // Groups absent from the chain end up empty, unless this is an
    // incremental restore, which leaves them alone.
    let work: Vec<(u32, GroupPlan, GroupState)> = cluster
        .groups()
        .filter_map(|g| {
            let gid = g.id();
            let base = if incremental { g.state_snapshot() } else { GroupState::new() };
            match resolved.plans.get(&gid) {
                Some(p) => Some((gid, p.clone(), base)),
                None if incremental => None,
                None => Some((gid, empty_plan(gid), base)),
            }
        })
        .collect();

    let results: Vec<(u32, Result<(GroupState, BTreeSet<String>, usize)>)> = thread::scope(|s| {
        let handles: Vec<_> = work
            .into_iter()
            .map(|(gid, plan, base)| {
                let h = s.spawn(move || {
                    replay_group(blob, &plan, base, key).map(|(st, n)| (st, plan.assigned, n))
                });
                (gid, h)
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

    let mut rebuilt: BTreeMap<u32, (GroupState, BTreeSet<String>, usize)> = BTreeMap::new();
    for (gid, r) in results {
        match r {
            Ok(v) => {
                rebuilt.insert(gid, v);
            }
            Err(e) => {
                record_restore_failed();
                warn!("restore: online group {} failed, cluster stays draining: {:#}", gid, e);
                return Err(e.context(format!("online restore failed at group {}", gid)));
            }
        }
    }

    let groups: Vec<GroupRestoreResult> = rebuilt
        .iter()
        .map(|(gid, (state, _, applied))| group_result(*gid, state, *applied))
        .collect();
    let max_ts = groups.iter().map(|g| g.max_ts).max().unwrap_or(0).max(last.read_ts);

    {
        let _c = cluster.commit_guard();
        for (gid, (state, tablets, _)) in rebuilt {
            cluster.install_group(gid, state, tablets)?;
        }
        cluster.oracle().bump_to(max_ts);
        cluster.set_restore_point(Some(RestorePoint::of(last)));
        cluster.set_draining(false);
    }
    record_restore_completed();

    info!(
        "restore: online done, id={}, num={}, groups={}, max_ts={}",
        last.backup_id,
        last.backup_num,
        groups.len(),
        max_ts
    );
    Ok(RestoreSummary {
        backup_id: last.backup_id.clone(),
        backup_num: last.backup_num,
        read_ts: last.read_ts,
        max_ts,
        groups,
    })
}

/// Poll `probe` until it succeeds `restore_confirmations` times in a row.
///
/// DrainingRejected resets the streak and is retried; any other error ends
/// the wait. Gives up after `restore_max_polls` probes.
pub fn wait_for_restore<F>(mut probe: F, cfg: &BackupConfig) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    let need = cfg.restore_confirmations.max(1);
    let mut streak = 0u32;
    for attempt in 1..=cfg.restore_max_polls {
        match probe() {
            Ok(()) => {
                streak += 1;
                if streak >= need {
                    info!("restore: confirmed after {} probes", attempt);
                    return Ok(());
                }
            }
            Err(e) => match classify(&e) {
                Some(be) if be.is_retryable() => {
                    debug!("restore: probe {} rejected while draining", attempt);
                    streak = 0;
                }
                _ => return Err(e.context(format!("restore probe {} failed", attempt))),
            },
        }
        thread::sleep(Duration::from_millis(cfg.restore_poll_ms));
    }
    Err(anyhow!(
        "restore not confirmed: fewer than {} consecutive successful probes in {} attempts",
        need,
        cfg.restore_max_polls
    ))
}
