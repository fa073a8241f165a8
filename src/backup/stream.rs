//! backup/stream: one group's blob: frames -> zstd -> optional AES-GCM envelope.

use anyhow::{anyhow, Context, Result};
use std::io::{Cursor, Read};

use crate::crypto::{self, EncryptionKey};
use crate::error::BackupError;
use crate::store::codec::{decode_blob_payload, encode_blob_payload, BlobHeader};
use crate::store::Record;

/// Bytes to store at `path` for one group's records.
pub fn encode_group_blob(
    header: BlobHeader,
    records: &[Record],
    level: i32,
    key: Option<&EncryptionKey>,
    path: &str,
) -> Result<Vec<u8>> {
    let payload = encode_blob_payload(header, records);
    let compressed = zstd::bulk::compress(&payload, level)
        .map_err(|e| anyhow!("zstd compress group {} blob: {}", header.group_id, e))?;
    match key {
        Some(k) => crypto::seal(k, &compressed, path.as_bytes()),
        None => Ok(compressed),
    }
}

/// Inverse of `encode_group_blob`. `encrypted` is what the manifest declares.
pub fn decode_group_blob(
    bytes: &[u8],
    encrypted: bool,
    key: Option<&EncryptionKey>,
    path: &str,
) -> Result<(BlobHeader, Vec<Record>)> {
    let sealed = crypto::is_sealed(bytes);
    if sealed != encrypted {
        return Err(BackupError::EncryptionMismatch(format!(
            "blob {} is {} but its manifest says encrypted={}",
            path,
            if sealed { "encrypted" } else { "plain" },
            encrypted
        ))
        .into());
    }
    let opened;
    let compressed: &[u8] = if sealed {
        let k = key.ok_or_else(|| {
            BackupError::EncryptionMismatch(format!("blob {} is encrypted and no key was given", path))
        })?;
        opened = crypto::open(k, bytes, path.as_bytes()).with_context(|| format!("decrypt {}", path))?;
        &opened
    } else {
        bytes
    };

    let mut decoder = zstd::stream::read::Decoder::new(Cursor::new(compressed))
        .map_err(|e| anyhow!("zstd decoder init ({}): {}", path, e))?;
    let mut payload = Vec::new();
    decoder
        .read_to_end(&mut payload)
        .map_err(|e| anyhow!("zstd decode ({}): {}", path, e))?;

    decode_blob_payload(&payload).with_context(|| format!("decode group blob {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Key;

    #[test]
    fn plain_and_sealed_blobs_decode() {
        let recs = vec![Record { key: Key::data("name", 3), ts: 4, value: Some(b"bob".to_vec()) }];
        let hdr = BlobHeader { group_id: 1, read_ts: 9 };
        let path = "x.0001/r9-g1.backup";

        let plain = encode_group_blob(hdr, &recs, 3, None, path).unwrap();
        let (h, back) = decode_group_blob(&plain, false, None, path).unwrap();
        assert_eq!((h, back), (hdr, recs.clone()));

        let key = EncryptionKey::from_bytes(&[3u8; 32]).unwrap();
        let sealed = encode_group_blob(hdr, &recs, 3, Some(&key), path).unwrap();
        assert!(decode_group_blob(&sealed, true, None, path).is_err());
        assert!(decode_group_blob(&sealed, false, Some(&key), path).is_err());
        let (_, back) = decode_group_blob(&sealed, true, Some(&key), path).unwrap();
        assert_eq!(back, recs);
    }
}
