//! util: small helpers shared across backup, restore and the CLI.
//!
//! Contents:
//! - now_unix_ms(): wall clock in milliseconds (used in manifests and task records).
//! - to_hex()/decode_hex(): hex for key checksums and key files.
//! - new_backup_id(): identity of a fresh FULL chain.
//! - group_dir_name()/event_dir_name()/group_blob_name(): on-disk naming.

use anyhow::{anyhow, Result};
use rand::RngCore;

/// Current Unix time in milliseconds (0 if the clock is before the epoch).
#[inline]
pub fn now_unix_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(anyhow!("hex string must have even length"));
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(s.len() / 2);
    for i in (0..bytes.len()).step_by(2) {
        let h = (bytes[i] as char)
            .to_digit(16)
            .ok_or_else(|| anyhow!("invalid hex at pos {}", i))?;
        let l = (bytes[i + 1] as char)
            .to_digit(16)
            .ok_or_else(|| anyhow!("invalid hex at pos {}", i + 1))?;
        out.push(((h << 4) | l) as u8);
    }
    Ok(out)
}

/// Identity of a new FULL chain: `sv_<readTs hex>_<8 random hex>`.
pub fn new_backup_id(read_ts: u64) -> String {
    let mut salt = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut salt);
    format!("sv_{:x}_{}", read_ts, to_hex(&salt))
}

/// Directory of one restored group under the restore root.
#[inline]
pub fn group_dir_name(group_id: u32) -> String {
    format!("p{}", group_id)
}

/// Directory of one backup event inside the backup location.
#[inline]
pub fn event_dir_name(backup_id: &str, backup_num: u64) -> String {
    format!("{}.{:04}", backup_id, backup_num)
}

/// Blob name of one group's data inside an event directory.
#[inline]
pub fn group_blob_name(read_ts: u64, group_id: u32) -> String {
    format!("r{}-g{}.backup", read_ts, group_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_and_errors() {
        let v = vec![0x00, 0xAB, 0x7F, 0xFF];
        let s = to_hex(&v);
        assert_eq!(s, "00ab7fff");
        assert_eq!(decode_hex(&s).unwrap(), v);
        assert_eq!(decode_hex("  00AB7fff\n").unwrap(), v);
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
    }

    #[test]
    fn naming_is_deterministic() {
        assert_eq!(group_dir_name(3), "p3");
        assert_eq!(event_dir_name("sv_10_aa", 2), "sv_10_aa.0002");
        assert_eq!(group_blob_name(42, 1), "r42-g1.backup");

        let id = new_backup_id(0x2a);
        assert!(id.starts_with("sv_2a_"));
        assert_eq!(id.len(), "sv_2a_".len() + 8);
    }
}
