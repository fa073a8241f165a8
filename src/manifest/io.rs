//! manifest/io: reading and committing the root manifest log.

use anyhow::{Context, Result};
use log::{debug, warn};

use super::{decode_log, encode_log, ManifestLog, MasterManifest};
use crate::blob::BlobStore;
use crate::error::BackupError;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Root manifest log of a location. A location with no log yet has an empty one.
pub fn read_manifest_log(blob: &dyn BlobStore) -> Result<ManifestLog> {
    match blob.get(MANIFEST_FILE)? {
        None => Ok(ManifestLog::default()),
        Some(bytes) => decode_log(&bytes)
            .with_context(|| format!("decode {}/{}", blob.location(), MANIFEST_FILE)),
    }
}

/// Commit point of a backup event: one atomic put of the whole log.
pub fn write_manifest_log(blob: &dyn BlobStore, log: &ManifestLog) -> Result<()> {
    let bytes = encode_log(log)?;
    blob.put(MANIFEST_FILE, &bytes)
        .with_context(|| format!("write {}/{}", blob.location(), MANIFEST_FILE))?;
    debug!(
        "manifest: committed log, location={}, entries={}",
        blob.location(),
        log.len()
    );
    Ok(())
}

/// Committed chain entries of a location in commit order.
pub fn load_chain(blob: &dyn BlobStore) -> Result<Vec<MasterManifest>> {
    Ok(read_manifest_log(blob)?.manifests)
}

/// Every group blob of every entry in `series` must exist.
///
/// A committed entry is never skipped: a missing blob fails the whole
/// restore with the entry's backupNum, whether it is the newest entry or not.
pub fn check_blobs(blob: &dyn BlobStore, series: &[MasterManifest]) -> Result<()> {
    for m in series {
        for g in m.manifests.values() {
            if !blob.exists(&g.path)? {
                warn!(
                    "manifest: {}.{} is committed but blob {} is missing",
                    m.backup_id, m.backup_num, g.path
                );
                return Err(BackupError::MissingBlob {
                    backup_num: m.backup_num,
                    path: g.path.clone(),
                }
                .into());
            }
        }
    }
    Ok(())
}
