// tests/move_tablets.rs
//
// A predicate moves g1 -> g2, gets new data, then moves back g2 -> g1.
// Each restore point must show the predicate in exactly one group, the one
// that owned it when that backup was taken, with all of its versions.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use shardvault::store::{GroupState, MvccStore};
use shardvault::{
    run_backup, run_offline_restore, BackupConfig, BackupRequest, Cluster, FsBlobStore,
    RestoreOptions, RestoreTarget,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("svtest-move-{prefix}-{pid}-{t}-{id}"))
}

fn restore_groups(blob: &FsBlobStore, num: i64, dest: &Path) -> Result<BTreeMap<u32, GroupState>> {
    run_offline_restore(
        blob,
        dest,
        &RestoreTarget::backup_num(num),
        &RestoreOptions::default(),
        &BackupConfig::default(),
    )?;
    let mut out = BTreeMap::new();
    for entry in fs::read_dir(dest)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let store = MvccStore::open(&entry.path())?;
            out.insert(store.group_id(), store.state().clone());
        }
    }
    Ok(out)
}

fn names(st: &GroupState) -> Vec<u64> {
    st.predicate_values("name", u64::MAX).into_keys().collect()
}

#[test]
fn tablet_moves_away_and_back() -> Result<()> {
    let cfg = BackupConfig::default();
    let location = unique_root("loc");
    let blob = FsBlobStore::open(&location)?;

    let c = Cluster::new(&[1, 2])?;
    c.alter_schema("name", "string")?;
    c.alter_schema("age", "int")?;
    assert_eq!(c.owner_of("name"), Some(1));
    let t_old = c.mutate(&[(1, "name", "a"), (2, "name", "b"), (1, "age", "7")])?;
    run_backup(&c, &blob, &BackupRequest::default(), &cfg)?;

    c.move_tablet("name", 2)?;
    c.mutate(&[(3, "name", "c")])?;
    let m2 = run_backup(&c, &blob, &BackupRequest::default(), &cfg)?;
    assert!(m2.manifests[&2].predicates.contains("name"));
    assert!(!m2.manifests[&1].predicates.contains("name"));

    c.move_tablet("name", 1)?;
    c.mutate(&[(4, "name", "d"), (1, "name", "aa")])?;
    let m3 = run_backup(&c, &blob, &BackupRequest::default(), &cfg)?;
    assert!(m3.manifests[&1].predicates.contains("name"));

    let d1 = unique_root("d1");
    let g = restore_groups(&blob, 1, &d1)?;
    assert_eq!(names(&g[&1]), vec![1, 2]);
    assert!(names(&g[&2]).is_empty());

    let d2 = unique_root("d2");
    let g = restore_groups(&blob, 2, &d2)?;
    assert!(names(&g[&1]).is_empty(), "group 1 must not keep a moved-out tablet");
    assert!(!g[&1].predicates(u64::MAX).contains("name"));
    assert_eq!(names(&g[&2]), vec![1, 2, 3]);
    assert_eq!(g[&2].schema_of("name", u64::MAX).as_deref(), Some("string"));
    // versions written before the move keep their ts
    assert!(g[&2].predicate_values("name", t_old).contains_key(&1));

    let d3 = unique_root("d3");
    let g = restore_groups(&blob, 3, &d3)?;
    assert_eq!(names(&g[&1]), vec![1, 2, 3, 4]);
    assert!(names(&g[&2]).is_empty());
    assert_eq!(
        g[&1].predicate_values("name", u64::MAX).get(&1).map(|v| v.as_slice()),
        Some(&b"aa"[..])
    );
    assert_eq!(
        g[&1].predicate_values("name", t_old).get(&1).map(|v| v.as_slice()),
        Some(&b"a"[..])
    );
    // the other tablet never moved
    assert_eq!(g[&2].predicate_values("age", u64::MAX).len(), 1);

    for d in [&location, &d1, &d2, &d3] {
        let _ = fs::remove_dir_all(d);
    }
    Ok(())
}

#[test]
fn moved_tablet_dropped_then_redeclared_elsewhere() -> Result<()> {
    let cfg = BackupConfig::default();
    let location = unique_root("loc-drop");
    let blob = FsBlobStore::open(&location)?;

    let c = Cluster::new(&[1, 2])?;
    c.mutate(&[(1, "name", "old")])?;
    run_backup(&c, &blob, &BackupRequest::default(), &cfg)?;

    c.move_tablet("name", 2)?;
    run_backup(&c, &blob, &BackupRequest::default(), &cfg)?;

    c.apply_drop(shardvault::DropRecord::attr("name"))?;
    c.alter_schema("other", "string")?;
    c.mutate(&[(9, "name", "new")])?;
    run_backup(&c, &blob, &BackupRequest::default(), &cfg)?;
    let owner = c.owner_of("name").unwrap_or(0);

    let d = unique_root("d");
    let g = restore_groups(&blob, 3, &d)?;
    let mut all = BTreeMap::new();
    for st in g.values() {
        all.extend(st.predicate_values("name", u64::MAX));
    }
    assert_eq!(all.len(), 1);
    assert_eq!(all.get(&9).map(|v| v.as_slice()), Some(&b"new"[..]));
    assert_eq!(names(&g[&owner]), vec![9]);

    let _ = fs::remove_dir_all(&location);
    let _ = fs::remove_dir_all(&d);
    Ok(())
}
