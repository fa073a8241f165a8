// tests/encryption.rs
//
// Encrypted chains: blobs are sealed, restore needs the same key, and a key
// change at the location starts a new FULL series.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use shardvault::admin::list_backups;
use shardvault::blob::BlobStore;
use shardvault::crypto::is_sealed;
use shardvault::store::MvccStore;
use shardvault::{
    classify, run_backup, run_offline_restore, BackupConfig, BackupError, BackupRequest,
    BackupType, Cluster, EncryptionKey, FsBlobStore, RestoreOptions, RestoreTarget,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("svtest-enc-{prefix}-{pid}-{t}-{id}"))
}

fn write_hex_key(path: &Path, byte: u8) -> Result<()> {
    let hex: String = std::iter::repeat(format!("{:02x}", byte)).take(32).collect();
    fs::write(path, format!("{}\n", hex))?;
    Ok(())
}

fn names(dest: &Path) -> Result<BTreeMap<u64, Vec<u8>>> {
    let mut out = BTreeMap::new();
    for entry in fs::read_dir(dest)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let store = MvccStore::open(&entry.path())?;
            out.extend(store.state().predicate_values("name", u64::MAX));
        }
    }
    Ok(out)
}

#[test]
fn encrypted_chain_needs_the_right_key() -> Result<()> {
    let work = unique_root("work");
    fs::create_dir_all(&work)?;
    let key_a = work.join("a.key");
    let key_b = work.join("b.key");
    write_hex_key(&key_a, 0x11)?;
    write_hex_key(&key_b, 0x22)?;

    let location = work.join("loc");
    let blob = FsBlobStore::open(&location)?;
    let cfg = BackupConfig::default().with_encryption_key_file(Some(&key_a));

    let c = Cluster::new(&[1, 2])?;
    c.mutate(&[(1, "name", "secret"), (2, "age", "9")])?;
    let m1 = run_backup(&c, &blob, &BackupRequest::default(), &cfg)?;
    c.mutate(&[(3, "name", "more")])?;
    let m2 = run_backup(&c, &blob, &BackupRequest::default(), &cfg)?;
    assert!(m1.encrypted && m2.encrypted);
    assert_eq!(
        m1.encryption_key_checksum.as_deref(),
        Some(EncryptionKey::from_file(&key_a)?.checksum_hex().as_str())
    );
    assert_eq!(m2.backup_type, BackupType::Incremental);

    let listing = list_backups(&blob)?;
    assert!(listing.iter().all(|b| b.encrypted));

    for m in m2.manifests.values() {
        let bytes = blob.get(&m.path)?.unwrap_or_default();
        assert!(is_sealed(&bytes), "{} must be sealed", m.path);
        assert!(!bytes.windows(6).any(|w| w == b"secret"));
    }

    let plain_cfg = BackupConfig::default();

    // no key
    let dest = work.join("no-key");
    let err = match run_offline_restore(&blob, &dest, &RestoreTarget::latest(), &RestoreOptions::default(), &plain_cfg) {
        Ok(_) => panic!("restore without a key must fail"),
        Err(e) => e,
    };
    assert!(matches!(classify(&err), Some(BackupError::EncryptionMismatch(_))));
    assert!(!dest.exists());

    // wrong key
    let dest = work.join("wrong-key");
    let opts = RestoreOptions::default().with_key(EncryptionKey::from_file(&key_b)?);
    let err = match run_offline_restore(&blob, &dest, &RestoreTarget::latest(), &opts, &plain_cfg) {
        Ok(_) => panic!("restore with a wrong key must fail"),
        Err(e) => e,
    };
    assert!(matches!(classify(&err), Some(BackupError::EncryptionMismatch(_))));
    assert!(!dest.exists());

    // right key
    let dest = work.join("ok");
    let opts = RestoreOptions::default().with_key(EncryptionKey::from_file(&key_a)?);
    let s = run_offline_restore(&blob, &dest, &RestoreTarget::latest(), &opts, &plain_cfg)?;
    assert_eq!(s.backup_num, 2);
    let got = names(&dest)?;
    assert_eq!(got.get(&1).map(|v| v.as_slice()), Some(&b"secret"[..]));
    assert_eq!(got.get(&3).map(|v| v.as_slice()), Some(&b"more"[..]));

    let _ = fs::remove_dir_all(&work);
    Ok(())
}

#[test]
fn key_change_starts_a_new_series() -> Result<()> {
    let work = unique_root("rotate");
    fs::create_dir_all(&work)?;
    let key_a = work.join("a.key");
    let key_b = work.join("b.key");
    write_hex_key(&key_a, 0x33)?;
    write_hex_key(&key_b, 0x44)?;

    let location = work.join("loc");
    let blob = FsBlobStore::open(&location)?;
    let c = Cluster::new(&[1])?;

    c.mutate(&[(1, "name", "a")])?;
    let m1 = run_backup(&c, &blob, &BackupRequest::default(), &BackupConfig::default())?;
    assert!(!m1.encrypted);

    // plain -> encrypted
    c.mutate(&[(2, "name", "b")])?;
    let cfg_a = BackupConfig::default().with_encryption_key_file(Some(&key_a));
    let m2 = run_backup(&c, &blob, &BackupRequest::default(), &cfg_a)?;
    assert_eq!(m2.backup_type, BackupType::Full);
    assert_ne!(m2.backup_id, m1.backup_id);

    // key a -> key b
    let cfg_b = BackupConfig::default().with_encryption_key_file(Some(&key_b));
    let m3 = run_backup(&c, &blob, &BackupRequest::default(), &cfg_b)?;
    assert_eq!(m3.backup_type, BackupType::Full);
    assert_ne!(m3.backup_id, m2.backup_id);

    // same key b -> incremental
    c.mutate(&[(3, "name", "c")])?;
    let m4 = run_backup(&c, &blob, &BackupRequest::default(), &cfg_b)?;
    assert_eq!(m4.backup_type, BackupType::Incremental);
    assert_eq!(m4.backup_id, m3.backup_id);

    // the plain series is still restorable without a key
    let dest = work.join("plain");
    run_offline_restore(
        &blob,
        &dest,
        &RestoreTarget::latest().with_backup_id(m1.backup_id.clone()),
        &RestoreOptions::default(),
        &BackupConfig::default(),
    )?;
    assert_eq!(names(&dest)?.len(), 1);

    let _ = fs::remove_dir_all(&work);
    Ok(())
}
