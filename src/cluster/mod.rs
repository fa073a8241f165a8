//! cluster: in-process stand-in for the live sharded store.
//!
//! Backup reads from it and online restore writes into it. It models what the
//! subsystem needs from the outside world and nothing more:
//! - groups owning disjoint predicate sets (tablets), each with an MVCC state;
//! - a timestamp oracle (commit ts for writes, read ts for backups);
//! - drop and tablet-move logs per group, so a backup can describe its window;
//! - a draining flag that rejects reads, writes and backups during an online restore.
//!
//! Every write runs under one commit lock: timestamps are allocated and applied
//! in the same order, and a backup that captures under the lock sees exactly
//! the commits <= its read ts. The draining flag is checked after the lock is
//! taken, and an online restore flips it and installs under the same lock.
//!
//! Window logs are trimmed through the oldest read ts any backup location
//! has committed; no later incremental backup can ask for older entries.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::BackupError;
use crate::manifest::{DropKind, DropRecord};
use crate::restore::{reconcile, RestorePoint};
use crate::store::{GroupState, Key};

mod group;
mod oracle;

pub use group::{Group, GroupChanges};
pub use oracle::{LocalOracle, TimestampOracle};

/// Schema recorded for a predicate first seen through a mutation.
pub const DEFAULT_SCHEMA: &str = "default";

pub struct Cluster {
    groups: BTreeMap<u32, Arc<Group>>,
    oracle: Arc<dyn TimestampOracle>,
    draining: AtomicBool,
    commit: Mutex<()>,
    restore_point: Mutex<Option<RestorePoint>>,
    /// backup location -> read ts of its last committed backup
    backup_marks: Mutex<BTreeMap<String, u64>>,
}

impl Cluster {
    pub fn new(group_ids: &[u32]) -> Result<Self> {
        Self::with_oracle(group_ids, Arc::new(LocalOracle::new()))
    }

    pub fn with_oracle(group_ids: &[u32], oracle: Arc<dyn TimestampOracle>) -> Result<Self> {
        if group_ids.is_empty() {
            return Err(anyhow!("cluster needs at least one group"));
        }
        let mut groups = BTreeMap::new();
        for &gid in group_ids {
            if gid == 0 {
                return Err(anyhow!("group id 0 is reserved"));
            }
            if groups.insert(gid, Arc::new(Group::new(gid))).is_some() {
                return Err(anyhow!("duplicate group id {}", gid));
            }
        }
        info!("cluster: up, groups={:?}", group_ids);
        Ok(Self {
            groups,
            oracle,
            draining: AtomicBool::new(false),
            commit: Mutex::new(()),
            restore_point: Mutex::new(None),
            backup_marks: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn oracle(&self) -> &Arc<dyn TimestampOracle> {
        &self.oracle
    }

    pub fn group_ids(&self) -> Vec<u32> {
        self.groups.keys().copied().collect()
    }

    pub fn group(&self, gid: u32) -> Option<Arc<Group>> {
        self.groups.get(&gid).cloned()
    }

    pub fn groups(&self) -> impl Iterator<Item = &Arc<Group>> {
        self.groups.values()
    }

    pub fn set_draining(&self, on: bool) {
        let was = self.draining.swap(on, Ordering::AcqRel);
        if was != on {
            info!("cluster: draining={}", on);
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn check_not_draining(&self) -> Result<()> {
        if self.is_draining() {
            return Err(BackupError::DrainingRejected.into());
        }
        Ok(())
    }

    pub(crate) fn commit_guard(&self) -> MutexGuard<'_, ()> {
        lock_or_recover(&self.commit)
    }

    /// Commit lock for a write; draining is checked once the lock is held.
    fn begin_commit(&self) -> Result<MutexGuard<'_, ()>> {
        let g = self.commit_guard();
        self.check_not_draining()?;
        Ok(g)
    }

    /// Commit ts for a write. The state no longer matches any restore point.
    fn next_write_ts(&self) -> u64 {
        if lock_or_recover(&self.restore_point).take().is_some() {
            debug!("cluster: write after restore, restore point cleared");
        }
        self.oracle.next_commit_ts()
    }

    /// The backup entry the current state was restored to, if no write
    /// happened since.
    pub fn restore_point(&self) -> Option<RestorePoint> {
        lock_or_recover(&self.restore_point).clone()
    }

    pub(crate) fn set_restore_point(&self, point: Option<RestorePoint>) {
        *lock_or_recover(&self.restore_point) = point;
    }

    /// Record a committed backup and trim window logs no location still needs.
    pub fn backup_committed(&self, location: &str, read_ts: u64) {
        let floor = {
            let mut marks = lock_or_recover(&self.backup_marks);
            marks.insert(location.to_string(), read_ts);
            marks.values().copied().min().unwrap_or(0)
        };
        let mut trimmed = 0usize;
        for g in self.groups.values() {
            trimmed += g.trim_logs(floor);
        }
        debug!(
            "cluster: backup at {} committed read_ts={}, logs trimmed through {}, entries={}",
            location, read_ts, floor, trimmed
        );
    }

    pub fn owner_of(&self, predicate: &str) -> Option<u32> {
        self.groups
            .values()
            .find(|g| g.read().tablets.contains(predicate))
            .map(|g| g.id())
    }

    /// predicate -> owning group.
    pub fn tablets(&self) -> BTreeMap<String, u32> {
        let mut out = BTreeMap::new();
        for g in self.groups.values() {
            for p in g.read().tablets.iter() {
                out.insert(p.clone(), g.id());
            }
        }
        out
    }

    /// Owner of a predicate, assigning it to the least loaded group on first use.
    /// Caller holds the commit lock.
    fn assign(&self, predicate: &str) -> Result<Arc<Group>> {
        if let Some(g) = self.owner_of(predicate).and_then(|gid| self.groups.get(&gid)) {
            return Ok(g.clone());
        }
        let g = self
            .groups
            .values()
            .min_by_key(|g| (g.read().tablets.len(), g.id()))
            .cloned()
            .ok_or_else(|| anyhow!("cluster has no groups"))?;
        g.write().tablets.insert(predicate.to_string());
        debug!("cluster: tablet {} -> group {}", predicate, g.id());
        Ok(g)
    }

    // ----- writes -----

    /// Declare (or redeclare) a predicate's type.
    pub fn alter_schema(&self, predicate: &str, ty: &str) -> Result<u64> {
        let _c = self.begin_commit()?;
        let ts = self.next_write_ts();
        let g = self.assign(predicate)?;
        g.write()
            .state
            .put(Key::schema(predicate), ts, Some(ty.as_bytes().to_vec()));
        Ok(ts)
    }

    /// Define a type; types live in every group.
    pub fn define_type(&self, name: &str, fields: &[&str]) -> Result<u64> {
        let _c = self.begin_commit()?;
        let ts = self.next_write_ts();
        let value = fields.join(",").into_bytes();
        for g in self.groups.values() {
            g.write().state.put(Key::type_def(name), ts, Some(value.clone()));
        }
        Ok(ts)
    }

    /// Set (uid, predicate, value) triples in one commit.
    pub fn mutate(&self, set: &[(u64, &str, &str)]) -> Result<u64> {
        if set.is_empty() {
            return Err(anyhow!("empty mutation"));
        }
        let _c = self.begin_commit()?;
        let ts = self.next_write_ts();
        for (uid, pred, value) in set {
            let g = self.assign(pred)?;
            let mut inner = g.write();
            if inner.state.schema_of(pred, u64::MAX).is_none() {
                inner
                    .state
                    .put(Key::schema(*pred), ts, Some(DEFAULT_SCHEMA.as_bytes().to_vec()));
            }
            inner
                .state
                .put(Key::data(*pred, *uid), ts, Some(value.as_bytes().to_vec()));
        }
        Ok(ts)
    }

    /// Delete (uid, predicate) values in one commit.
    pub fn delete(&self, del: &[(u64, &str)]) -> Result<u64> {
        if del.is_empty() {
            return Err(anyhow!("empty delete"));
        }
        let _c = self.begin_commit()?;
        let ts = self.next_write_ts();
        for (uid, pred) in del {
            let gid = self
                .owner_of(pred)
                .ok_or_else(|| anyhow!("delete: unknown predicate '{}'", pred))?;
            if let Some(g) = self.groups.get(&gid) {
                g.write().state.put(Key::data(*pred, *uid), ts, None);
            }
        }
        Ok(ts)
    }

    /// Run a drop and record it for the next backup window.
    /// ALL and DATA touch every group; ATTR touches the predicate's owner.
    pub fn apply_drop(&self, drop: DropRecord) -> Result<u64> {
        drop.check()?;
        let _c = self.begin_commit()?;
        let ts = self.next_write_ts();

        let targets: Vec<&Arc<Group>> = match (drop.kind, drop.predicate.as_deref()) {
            (DropKind::Attr, Some(p)) => match self.owner_of(p) {
                Some(gid) => self.groups.get(&gid).into_iter().collect(),
                None => {
                    warn!("cluster: drop attr {}: predicate has no tablet", p);
                    Vec::new()
                }
            },
            _ => self.groups.values().collect(),
        };

        for g in targets {
            let mut inner = g.write();
            let state = std::mem::take(&mut inner.state);
            inner.state = reconcile::apply(state, &drop);
            match (drop.kind, drop.predicate.as_deref()) {
                (DropKind::All, _) => inner.tablets.clear(),
                (DropKind::Attr, Some(p)) => {
                    inner.tablets.remove(p);
                }
                _ => {}
            }
            inner.drops.push((ts, drop.clone()));
        }
        info!("cluster: drop {:?} {:?} at ts={}", drop.kind, drop.predicate, ts);
        Ok(ts)
    }

    /// Move every version of a predicate to another group.
    pub fn move_tablet(&self, predicate: &str, to: u32) -> Result<u64> {
        let _c = self.begin_commit()?;
        let from = self
            .owner_of(predicate)
            .ok_or_else(|| anyhow!("move: unknown predicate '{}'", predicate))?;
        if from == to {
            return Err(anyhow!("move: {} already belongs to group {}", predicate, to));
        }
        let dst = self
            .groups
            .get(&to)
            .ok_or_else(|| anyhow!("move: no group {}", to))?;
        let src = self
            .groups
            .get(&from)
            .ok_or_else(|| anyhow!("move: no group {}", from))?;

        let ts = self.next_write_ts();
        let taken = {
            let mut inner = src.write();
            inner.tablets.remove(predicate);
            inner.moved_out.push((ts, predicate.to_string()));
            inner.state.take_predicate(predicate)
        };
        {
            let mut inner = dst.write();
            inner.state.merge_versions(taken);
            inner.tablets.insert(predicate.to_string());
            inner.moved_in.push((ts, predicate.to_string()));
        }
        info!("cluster: moved {} from group {} to {} at ts={}", predicate, from, to, ts);
        Ok(ts)
    }

    // ----- reads -----

    fn read_ts_or_latest(&self, read_ts: Option<u64>) -> u64 {
        read_ts.unwrap_or_else(|| self.oracle.max_committed_ts())
    }

    pub fn get(&self, predicate: &str, uid: u64, read_ts: Option<u64>) -> Result<Option<Vec<u8>>> {
        self.check_not_draining()?;
        let ts = self.read_ts_or_latest(read_ts);
        let gid = match self.owner_of(predicate) {
            Some(g) => g,
            None => return Ok(None),
        };
        Ok(self
            .groups
            .get(&gid)
            .and_then(|g| g.read().state.get_at(&Key::data(predicate, uid), ts).map(|v| v.to_vec())))
    }

    /// uid -> value of one predicate.
    pub fn predicate_values(&self, predicate: &str, read_ts: Option<u64>) -> Result<BTreeMap<u64, Vec<u8>>> {
        self.check_not_draining()?;
        let ts = self.read_ts_or_latest(read_ts);
        Ok(match self.owner_of(predicate).and_then(|gid| self.groups.get(&gid)) {
            Some(g) => g.read().state.predicate_values(predicate, ts),
            None => BTreeMap::new(),
        })
    }

    /// predicate -> declared type, across all groups.
    pub fn schema(&self, read_ts: Option<u64>) -> Result<BTreeMap<String, String>> {
        self.check_not_draining()?;
        let ts = self.read_ts_or_latest(read_ts);
        let mut out = BTreeMap::new();
        for g in self.groups.values() {
            let inner = g.read();
            for p in inner.state.predicates(ts) {
                if let Some(ty) = inner.state.schema_of(&p, ts) {
                    out.insert(p, ty);
                }
            }
        }
        Ok(out)
    }

    pub fn types(&self, read_ts: Option<u64>) -> Result<BTreeSet<String>> {
        self.check_not_draining()?;
        let ts = self.read_ts_or_latest(read_ts);
        let mut out = BTreeSet::new();
        for g in self.groups.values() {
            out.extend(g.read().state.types(ts));
        }
        Ok(out)
    }

    pub fn max_ts(&self) -> u64 {
        self.groups.values().map(|g| g.max_ts()).max().unwrap_or(0)
    }

    // ----- backup / restore hooks -----

    /// A fresh read ts (above every commit so far) plus each group's changes
    /// for the window. Writes wait while this runs; streaming the result does
    /// not hold the lock. Refused while an online restore is draining.
    pub fn capture(&self, since: Option<u64>) -> Result<(u64, BTreeMap<u32, GroupChanges>)> {
        let _c = self.begin_commit()?;
        let read_ts = self.oracle.next_commit_ts();
        let changes = self
            .groups
            .iter()
            .map(|(gid, g)| (*gid, g.collect_changes(since, read_ts)))
            .collect();
        Ok((read_ts, changes))
    }

    /// Replace one group's contents (online restore). Caller holds the commit lock.
    pub(crate) fn install_group(&self, gid: u32, state: GroupState, tablets: BTreeSet<String>) -> Result<()> {
        let g = self
            .groups
            .get(&gid)
            .ok_or_else(|| anyhow!("restore: cluster has no group {}", gid))?;
        g.install(state, tablets);
        Ok(())
    }
}

fn lock_or_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tablets_spread_and_move() {
        let c = Cluster::new(&[1, 2]).unwrap();
        c.alter_schema("name", "string").unwrap();
        c.alter_schema("age", "int").unwrap();
        assert_eq!(c.owner_of("name"), Some(1));
        assert_eq!(c.owner_of("age"), Some(2));

        c.mutate(&[(1, "name", "alice"), (1, "age", "30")]).unwrap();
        c.move_tablet("name", 2).unwrap();
        assert_eq!(c.owner_of("name"), Some(2));
        assert_eq!(c.get("name", 1, None).unwrap(), Some(b"alice".to_vec()));
        assert!(c.group(1).unwrap().tablets().is_empty());
    }

    #[test]
    fn reads_see_their_timestamp() {
        let c = Cluster::new(&[1]).unwrap();
        let t1 = c.mutate(&[(7, "name", "a")]).unwrap();
        let t2 = c.mutate(&[(7, "name", "b")]).unwrap();
        c.delete(&[(7, "name")]).unwrap();
        assert_eq!(c.get("name", 7, Some(t1)).unwrap(), Some(b"a".to_vec()));
        assert_eq!(c.get("name", 7, Some(t2)).unwrap(), Some(b"b".to_vec()));
        assert_eq!(c.get("name", 7, None).unwrap(), None);
        assert_eq!(c.schema(None).unwrap().get("name").map(String::as_str), Some(DEFAULT_SCHEMA));
    }

    #[test]
    fn draining_rejects_reads_and_writes() {
        let c = Cluster::new(&[1]).unwrap();
        c.set_draining(true);
        let err = c.get("name", 1, None).unwrap_err();
        assert_eq!(crate::error::classify(&err), Some(&BackupError::DrainingRejected));
        assert!(c.mutate(&[(1, "name", "x")]).is_err());
        c.set_draining(false);
        assert!(c.mutate(&[(1, "name", "x")]).is_ok());
    }

    #[test]
    fn write_waiting_on_the_commit_lock_sees_draining() {
        let c = Arc::new(Cluster::new(&[1]).unwrap());
        let held = c.commit_guard();
        let writer = {
            let c = c.clone();
            std::thread::spawn(move || c.mutate(&[(1, "name", "late")]))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        c.set_draining(true);
        drop(held);

        let err = writer.join().unwrap().unwrap_err();
        assert_eq!(crate::error::classify(&err), Some(&BackupError::DrainingRejected));
        c.set_draining(false);
        assert_eq!(c.get("name", 1, None).unwrap(), None);
    }

    #[test]
    fn capture_is_refused_while_draining() {
        let c = Cluster::new(&[1]).unwrap();
        c.mutate(&[(1, "name", "a")]).unwrap();
        c.set_draining(true);
        let err = c.capture(None).unwrap_err();
        assert_eq!(crate::error::classify(&err), Some(&BackupError::DrainingRejected));
        c.set_draining(false);
        let (read_ts, changes) = c.capture(None).unwrap();
        assert!(read_ts > 0);
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn any_write_clears_the_restore_point() {
        let c = Cluster::new(&[1]).unwrap();
        let point = RestorePoint {
            backup_id: "sv_a".into(),
            backup_num: 2,
            read_ts: 20,
        };
        c.set_restore_point(Some(point.clone()));
        assert_eq!(c.restore_point(), Some(point));
        assert!(c.move_tablet("nothing", 1).is_err());
        assert!(c.restore_point().is_some());
        c.alter_schema("name", "string").unwrap();
        assert_eq!(c.restore_point(), None);
    }

    #[test]
    fn window_logs_trim_through_the_oldest_location() {
        let c = Cluster::new(&[1, 2]).unwrap();
        c.alter_schema("name", "string").unwrap();
        let t_drop = c.apply_drop(DropRecord::data()).unwrap();
        let t_move = c.move_tablet("name", 2).unwrap();
        let log_len = |gid: u32| {
            let g = c.group(gid).unwrap();
            let inner = g.read();
            inner.drops.len() + inner.moved_in.len() + inner.moved_out.len()
        };
        assert_eq!(log_len(1) + log_len(2), 4);

        // a second location still at an older read ts keeps both entries
        c.backup_committed("/b", t_drop - 1);
        c.backup_committed("/a", t_move);
        assert_eq!(log_len(1) + log_len(2), 4);

        // once it catches up past the drop only the move remains
        c.backup_committed("/b", t_drop);
        assert_eq!(log_len(1) + log_len(2), 2);
        c.backup_committed("/b", t_move);
        assert_eq!(log_len(1) + log_len(2), 0);
    }
}
