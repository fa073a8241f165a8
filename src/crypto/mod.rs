//! crypto: encryption of backup blobs (AES-256-GCM).
//!
//! Key material comes out-of-band as a key file. Accepted file contents:
//! - exactly 32 raw bytes;
//! - 64 hex characters (whitespace trimmed);
//! - base64 of 32 bytes (whitespace trimmed).
//!
//! Every manifest of an encrypted chain records the key checksum
//! (SHA-256 of the key, hex). Restore refuses a key whose checksum differs.
//!
//! Envelope format (LE):
//!   MAGIC8 = "SVBLOB1\0"
//!   [nonce 12]
//!   [tag 16]
//!   u32 ct_len
//!   [ciphertext bytes]
//!
//! AAD = blob path inside the backup location, so a blob cannot be swapped
//! for another group's or another event's blob under the same key.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce, Tag,
};
use anyhow::{anyhow, Context, Result};
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use zeroize::Zeroize;

use crate::util::{decode_hex, to_hex};

const MAGIC: &[u8; 8] = b"SVBLOB1\0";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 8 + NONCE_LEN + TAG_LEN + 4;

/// 32-byte AES key. Wiped on drop; Debug never prints the key.
#[derive(Clone)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl EncryptionKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(anyhow!(
                "encryption key must be 32 bytes, got {}",
                bytes.len()
            ));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Load a key file (raw, hex or base64; see module docs).
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut raw = std::fs::read(path)
            .with_context(|| format!("read key file {}", path.display()))?;
        let res = Self::parse_key_file(&raw)
            .with_context(|| format!("parse key file {}", path.display()));
        raw.zeroize();
        res
    }

    fn parse_key_file(raw: &[u8]) -> Result<Self> {
        if raw.len() == 32 {
            return Self::from_bytes(raw);
        }
        let text = std::str::from_utf8(raw)
            .map_err(|_| anyhow!("key file is neither 32 raw bytes nor text"))?
            .trim();
        if text.len() == 64 {
            if let Ok(mut v) = decode_hex(text) {
                let res = Self::from_bytes(&v);
                v.zeroize();
                return res;
            }
        }
        let mut v = base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(|e| anyhow!("key file: not hex, not base64: {}", e))?;
        let res = Self::from_bytes(&v);
        v.zeroize();
        res
    }

    /// SHA-256 of the key, hex. Recorded in manifests, compared on restore.
    pub fn checksum_hex(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.key);
        to_hex(&h.finalize())
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey(checksum={})", self.checksum_hex())
    }
}

/// Encrypt `plaintext` into a self-describing envelope.
pub fn seal(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let mut buf = plaintext.to_vec();
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.key));
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buf)
        .map_err(|e| anyhow!("blob seal aes-gcm: {}", e))?;

    if buf.len() > u32::MAX as usize {
        return Err(anyhow!("blob too large to seal ({} bytes)", buf.len()));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + buf.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(tag.as_slice());
    let mut len4 = [0u8; 4];
    LittleEndian::write_u32(&mut len4, buf.len() as u32);
    out.extend_from_slice(&len4);
    out.extend_from_slice(&buf);
    Ok(out)
}

/// Decrypt an envelope produced by `seal` with the same key and AAD.
pub fn open(key: &EncryptionKey, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if !is_sealed(envelope) {
        return Err(anyhow!("blob is not an encrypted envelope"));
    }
    if envelope.len() < HEADER_LEN {
        return Err(anyhow!("encrypted blob too short ({} bytes)", envelope.len()));
    }
    let nonce = &envelope[8..8 + NONCE_LEN];
    let tag = &envelope[8 + NONCE_LEN..8 + NONCE_LEN + TAG_LEN];
    let ct_len = LittleEndian::read_u32(&envelope[HEADER_LEN - 4..HEADER_LEN]) as usize;
    if envelope.len() != HEADER_LEN + ct_len {
        return Err(anyhow!(
            "encrypted blob length mismatch: header says {}, have {}",
            ct_len,
            envelope.len() - HEADER_LEN
        ));
    }

    let mut buf = envelope[HEADER_LEN..].to_vec();
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.key));
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            aad,
            &mut buf,
            Tag::from_slice(tag),
        )
        .map_err(|_| anyhow!("blob authentication failed (wrong key or tampered data)"))?;
    Ok(buf)
}

#[inline]
pub fn is_sealed(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && &bytes[..MAGIC.len()] == MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> EncryptionKey {
        EncryptionKey::from_bytes(&[b; 32]).unwrap()
    }

    #[test]
    fn seal_open_and_aad_binding() {
        let k = key(7);
        let env = seal(&k, b"hello group 1", b"ev/r5-g1.backup").unwrap();
        assert!(is_sealed(&env));
        assert_eq!(open(&k, &env, b"ev/r5-g1.backup").unwrap(), b"hello group 1");

        // other path, other key: both rejected
        assert!(open(&k, &env, b"ev/r5-g2.backup").is_err());
        assert!(open(&key(8), &env, b"ev/r5-g1.backup").is_err());
    }

    #[test]
    fn key_file_formats_agree() {
        let raw = [0x11u8; 32];
        let from_raw = EncryptionKey::parse_key_file(&raw).unwrap();
        let from_hex = EncryptionKey::parse_key_file(to_hex(&raw).as_bytes()).unwrap();
        let b64 = base64::engine::general_purpose::STANDARD.encode(raw);
        let from_b64 = EncryptionKey::parse_key_file(format!("{}\n", b64).as_bytes()).unwrap();
        assert_eq!(from_raw.checksum_hex(), from_hex.checksum_hex());
        assert_eq!(from_raw.checksum_hex(), from_b64.checksum_hex());
        assert!(EncryptionKey::parse_key_file(b"short").is_err());
    }
}
