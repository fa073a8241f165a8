use std::collections::BTreeSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::manifest::DropRecord;
use crate::store::{GroupState, Record};

#[derive(Debug, Default)]
pub(crate) struct GroupInner {
    pub(crate) state: GroupState,
    pub(crate) tablets: BTreeSet<String>,
    /// Drops that touched this group, with their commit ts.
    pub(crate) drops: Vec<(u64, DropRecord)>,
    /// Tablets moved into this group, with the commit ts of the move.
    pub(crate) moved_in: Vec<(u64, String)>,
    /// Tablets moved out of this group, with the commit ts of the move.
    pub(crate) moved_out: Vec<(u64, String)>,
}

/// What a backup of one group carries for a (since, read_ts] window.
#[derive(Debug, Clone, Default)]
pub struct GroupChanges {
    pub records: Vec<Record>,
    pub drops: Vec<DropRecord>,
    pub predicates: BTreeSet<String>,
}

/// One shard: the predicates it owns and their versions.
#[derive(Debug)]
pub struct Group {
    id: u32,
    inner: RwLock<GroupInner>,
}

impl Group {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            inner: RwLock::new(GroupInner::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, GroupInner> {
        match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, GroupInner> {
        match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn tablets(&self) -> BTreeSet<String> {
        self.read().tablets.clone()
    }

    pub fn state_snapshot(&self) -> GroupState {
        self.read().state.clone()
    }

    pub fn max_ts(&self) -> u64 {
        self.read().state.max_ts()
    }

    /// Changes a backup at `read_ts` must carry.
    ///
    /// Full (since = None): every version <= read_ts, no drop markers (the
    /// state is already post-drop). Incremental: versions in (since, read_ts],
    /// all versions of tablets moved in during the window, and the window's
    /// drops in commit order.
    pub fn collect_changes(&self, since: Option<u64>, read_ts: u64) -> GroupChanges {
        let inner = self.read();
        let predicates = inner.tablets.clone();
        let since = match since {
            None => {
                return GroupChanges {
                    records: inner.state.records_between(0, read_ts),
                    drops: Vec::new(),
                    predicates,
                }
            }
            Some(s) => s,
        };

        let in_window = |ts: u64| ts > since && ts <= read_ts;

        let mut window = GroupState::new();
        for r in inner.state.records_between(since, read_ts) {
            window.apply(r);
        }
        for (ts, p) in &inner.moved_in {
            if in_window(*ts) {
                for r in inner.state.predicate_records_until(p, read_ts) {
                    window.apply(r);
                }
            }
        }

        // A tablet that left and came back inside the window replaces
        // whatever the previous backup had for it.
        let mut drops: Vec<(u64, DropRecord)> = inner
            .drops
            .iter()
            .filter(|(ts, _)| in_window(*ts))
            .cloned()
            .collect();
        for (ts, p) in &inner.moved_out {
            if in_window(*ts) && predicates.contains(p) {
                drops.push((*ts, DropRecord::attr(p.as_str())));
            }
        }
        drops.sort_by_key(|(ts, _)| *ts);
        let drops = drops.into_iter().map(|(_, d)| d).collect();

        GroupChanges {
            records: window.records_between(0, read_ts),
            drops,
            predicates,
        }
    }

    /// Forget window log entries committed at or before `through`.
    /// Returns how many were dropped.
    pub(crate) fn trim_logs(&self, through: u64) -> usize {
        let mut inner = self.write();
        let before = inner.drops.len() + inner.moved_in.len() + inner.moved_out.len();
        inner.drops.retain(|(ts, _)| *ts > through);
        inner.moved_in.retain(|(ts, _)| *ts > through);
        inner.moved_out.retain(|(ts, _)| *ts > through);
        before - (inner.drops.len() + inner.moved_in.len() + inner.moved_out.len())
    }

    /// Replace everything this group holds (online restore).
    pub(crate) fn install(&self, state: GroupState, tablets: BTreeSet<String>) {
        let mut inner = self.write();
        inner.state = state;
        inner.tablets = tablets;
        inner.drops.clear();
        inner.moved_in.clear();
        inner.moved_out.clear();
    }
}
