// tests/metamorphic_restore.rs
//
// Random workload, one backup per round:
//   mutate / delete / ATTR drop / DATA drop / ALL drop / tablet move / schema change.
// After each backup the live cluster is read at the backup's readTs; later the
// chain is restored to every backupNum (and to a commit ts between two backups)
// and each restore must read exactly what the live cluster read back then.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use oorandom::Rand64;

use shardvault::store::MvccStore;
use shardvault::{
    run_backup, run_offline_restore, BackupConfig, BackupRequest, Cluster, DropRecord,
    FsBlobStore, RestoreOptions, RestoreTarget,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("svtest-meta-{prefix}-{pid}-{t}-{id}"))
}

/// predicate -> (declared type, uid -> value)
type View = BTreeMap<String, (String, BTreeMap<u64, Vec<u8>>)>;

fn live_view(c: &Cluster) -> Result<View> {
    let mut out = View::new();
    for (p, ty) in c.schema(None)? {
        let vals = c.predicate_values(&p, None)?;
        out.insert(p, (ty, vals));
    }
    Ok(out)
}

fn restored_view(dest: &Path) -> Result<View> {
    let mut out = View::new();
    for entry in fs::read_dir(dest)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let store = MvccStore::open(&entry.path())?;
        let st = store.state();
        for p in st.predicates(u64::MAX) {
            let ty = st.schema_of(&p, u64::MAX).unwrap_or_default();
            let vals = st.predicate_values(&p, u64::MAX);
            let slot = out.entry(p).or_insert_with(|| (ty, BTreeMap::new()));
            slot.1.extend(vals);
        }
    }
    Ok(out)
}

const PREDS: [&str; 5] = ["name", "age", "friend", "city", "score"];
const GROUPS: [u32; 3] = [1, 2, 3];

fn random_round(c: &Cluster, rng: &mut Rand64) -> Result<()> {
    let ops = 1 + rng.rand_range(0..6);
    for _ in 0..ops {
        let pred = PREDS[rng.rand_range(0..PREDS.len() as u64) as usize];
        let roll = rng.rand_range(0..100);
        match roll {
            0..=49 => {
                let n = 1 + rng.rand_range(0..4);
                let vals: Vec<(u64, String)> = (0..n)
                    .map(|_| (1 + rng.rand_range(0..12), format!("v{}", rng.rand_u64() % 1000)))
                    .collect();
                let set: Vec<(u64, &str, &str)> =
                    vals.iter().map(|(u, v)| (*u, pred, v.as_str())).collect();
                c.mutate(&set)?;
            }
            50..=64 => {
                if c.owner_of(pred).is_some() {
                    let uid = 1 + rng.rand_range(0..12);
                    c.delete(&[(uid, pred)])?;
                }
            }
            65..=74 => {
                if let Some(from) = c.owner_of(pred) {
                    let to = GROUPS[rng.rand_range(0..GROUPS.len() as u64) as usize];
                    if to != from {
                        c.move_tablet(pred, to)?;
                    }
                }
            }
            75..=84 => {
                if c.owner_of(pred).is_some() {
                    c.apply_drop(DropRecord::attr(pred))?;
                }
            }
            85..=91 => {
                let ty = if rng.rand_u64() % 2 == 0 { "string" } else { "int" };
                c.alter_schema(pred, ty)?;
            }
            92..=96 => {
                c.apply_drop(DropRecord::data())?;
            }
            _ => {
                c.apply_drop(DropRecord::all())?;
            }
        }
    }
    Ok(())
}

#[test]
fn restore_matches_live_reads_at_every_backup() -> Result<()> {
    for seed in [0x5EED_0001u128, 0xC0FFEE, 0xBADC0DE] {
        run_seed(seed)?;
    }
    Ok(())
}

fn run_seed(seed: u128) -> Result<()> {
    let cfg = BackupConfig::default();
    let location = unique_root("loc");
    let blob = FsBlobStore::open(&location)?;
    let mut rng = Rand64::new(seed);

    let c = Cluster::new(&GROUPS)?;
    c.define_type("Thing", &PREDS)?;

    let mut expected: Vec<(u64, u64, View)> = Vec::new(); // (backup_num, read_ts, view)
    let mut backup_id = String::new();
    for _round in 0..12 {
        random_round(&c, &mut rng)?;
        let m = run_backup(&c, &blob, &BackupRequest::default(), &cfg)?;
        backup_id = m.backup_id.clone();
        expected.push((m.backup_num, m.read_ts, live_view(&c)?));
    }

    let mut dirs = Vec::new();
    for (num, _ts, want) in &expected {
        let dest = unique_root("dest");
        run_offline_restore(
            &blob,
            &dest,
            &RestoreTarget::backup_num(*num as i64).with_backup_id(backup_id.clone()),
            &RestoreOptions::default(),
            &cfg,
        )?;
        let got = restored_view(&dest)?;
        assert_eq!(&got, want, "seed {:#x}: backup {} differs", seed, num);
        dirs.push(dest);
    }

    // a commit ts between backups 5 and 6 restores backup 5
    let (num5, ts5, want5) = &expected[4];
    let (_, ts6, _) = &expected[5];
    let between = ts5 + (ts6 - ts5) / 2;
    let dest = unique_root("dest-ts");
    let s = run_offline_restore(
        &blob,
        &dest,
        &RestoreTarget::commit_ts(between),
        &RestoreOptions::default(),
        &cfg,
    )?;
    assert_eq!(s.backup_num, *num5);
    assert_eq!(&restored_view(&dest)?, want5);
    dirs.push(dest);

    // online restore of the latest into a fresh cluster
    let fresh = Cluster::new(&GROUPS)?;
    shardvault::run_online_restore(
        &fresh,
        &blob,
        &RestoreTarget::latest(),
        &RestoreOptions::default(),
        &cfg,
    )?;
    if let Some((_, _, want)) = expected.last() {
        assert_eq!(&live_view(&fresh)?, want);
    }

    let _ = fs::remove_dir_all(&location);
    for d in dirs {
        let _ = fs::remove_dir_all(d);
    }
    Ok(())
}
