use anyhow::{anyhow, Result};
use std::path::PathBuf;

use shardvault::backup::decode_group_blob;
use shardvault::blob::{BlobStore, FsBlobStore};
use shardvault::chain::{resolve, verify_key};
use shardvault::config::BackupConfig;
use shardvault::manifest::{check_blobs, load_chain};

use super::util::{load_key, target_from_args};

pub fn exec(
    location: PathBuf,
    backup_id: Option<String>,
    backup_num: Option<i64>,
    key_file: Option<PathBuf>,
) -> Result<()> {
    let cfg = BackupConfig::from_env();
    let blob = FsBlobStore::open(&location)?;
    let key = load_key(key_file)?;
    let target = target_from_args(backup_id, backup_num, None)?;

    let chain = load_chain(&blob)?;
    let series = resolve(&chain, &target)?;
    if cfg.verify_blobs {
        check_blobs(&blob, &series)?;
    }
    verify_key(&series, key.as_ref())?;

    let mut blobs = 0usize;
    let mut records = 0usize;
    for master in &series {
        for (gid, m) in &master.manifests {
            let bytes = blob
                .get(&m.path)?
                .ok_or_else(|| anyhow!("group {} blob {} is missing", gid, m.path))?;
            let (hdr, recs) = decode_group_blob(&bytes, m.encrypted, key.as_ref(), &m.path)?;
            if hdr.group_id != *gid {
                return Err(anyhow!(
                    "blob {} holds group {}, manifest declares {}",
                    m.path,
                    hdr.group_id,
                    gid
                ));
            }
            blobs += 1;
            records += recs.len();
        }
    }

    let last = series.last().ok_or_else(|| anyhow!("empty chain"))?;
    println!(
        "OK: {} backups 1..={} of {} verified ({} blobs, {} records, read_ts={})",
        series.len(),
        last.backup_num,
        last.backup_id,
        blobs,
        records,
        last.read_ts
    );
    Ok(())
}
