//! store/codec: binary formats shared by group stores and backup blobs.
//!
//! Record frame (LE), one per key version:
//!   [kind u8][flags u8][commit_ts u64][uid u64][attr_len u32][val_len u32][crc32 u32]
//!   + attr bytes (UTF-8) + value bytes
//! flags bit0 = value present (0 = tombstone). CRC32 covers the first 26 header
//! bytes, the attr and the value.
//!
//! Group blob payload (before zstd / encryption):
//!   MAGIC4 "SVBK" [version u32][group_id u32][read_ts u64] + record frames
//! The group id in the header is what restore checks against the manifest.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;

use super::{Key, KeyKind};

pub const FRAME_HDR: usize = 1 + 1 + 8 + 8 + 4 + 4 + 4;
const FLAG_HAS_VALUE: u8 = 0x01;

pub const BLOB_MAGIC: &[u8; 4] = b"SVBK";
pub const BLOB_VERSION: u32 = 1;
pub const BLOB_HDR: usize = 4 + 4 + 4 + 8;

/// One version of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Key,
    pub ts: u64,
    pub value: Option<Vec<u8>>,
}

pub fn encode_record(out: &mut Vec<u8>, key: &Key, ts: u64, value: Option<&[u8]>) {
    let attr = key.attr.as_bytes();
    let val = value.unwrap_or(&[]);

    let mut hdr = [0u8; FRAME_HDR];
    hdr[0] = key.kind as u8;
    hdr[1] = if value.is_some() { FLAG_HAS_VALUE } else { 0 };
    LittleEndian::write_u64(&mut hdr[2..10], ts);
    LittleEndian::write_u64(&mut hdr[10..18], key.uid);
    LittleEndian::write_u32(&mut hdr[18..22], attr.len() as u32);
    LittleEndian::write_u32(&mut hdr[22..26], val.len() as u32);

    let mut hasher = Crc32::new();
    hasher.update(&hdr[0..26]);
    hasher.update(attr);
    hasher.update(val);
    LittleEndian::write_u32(&mut hdr[26..30], hasher.finalize());

    out.extend_from_slice(&hdr);
    out.extend_from_slice(attr);
    out.extend_from_slice(val);
}

/// Decode a buffer that holds only whole frames. A torn tail or CRC mismatch is an error.
pub fn decode_records(buf: &[u8]) -> Result<Vec<Record>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        if pos + FRAME_HDR > buf.len() {
            return Err(anyhow!(
                "truncated frame header at off {} ({} bytes left)",
                pos,
                buf.len() - pos
            ));
        }
        let hdr = &buf[pos..pos + FRAME_HDR];
        let kind = KeyKind::from_u8(hdr[0])
            .ok_or_else(|| anyhow!("unknown key kind {} at off {}", hdr[0], pos))?;
        let flags = hdr[1];
        let ts = LittleEndian::read_u64(&hdr[2..10]);
        let uid = LittleEndian::read_u64(&hdr[10..18]);
        let attr_len = LittleEndian::read_u32(&hdr[18..22]) as usize;
        let val_len = LittleEndian::read_u32(&hdr[22..26]) as usize;
        let crc_expected = LittleEndian::read_u32(&hdr[26..30]);

        let body = pos + FRAME_HDR;
        let end = body + attr_len + val_len;
        if end > buf.len() {
            return Err(anyhow!(
                "truncated frame at off {}: need {} bytes, have {}",
                pos,
                end - pos,
                buf.len() - pos
            ));
        }
        let attr = &buf[body..body + attr_len];
        let val = &buf[body + attr_len..end];

        let mut hasher = Crc32::new();
        hasher.update(&hdr[0..26]);
        hasher.update(attr);
        hasher.update(val);
        if hasher.finalize() != crc_expected {
            return Err(anyhow!("frame CRC mismatch at off {}", pos));
        }

        let attr = std::str::from_utf8(attr)
            .map_err(|_| anyhow!("frame attr is not UTF-8 at off {}", pos))?
            .to_string();
        let value = if flags & FLAG_HAS_VALUE != 0 {
            Some(val.to_vec())
        } else {
            None
        };
        out.push(Record {
            key: Key { kind, attr, uid },
            ts,
            value,
        });
        pos = end;
    }
    Ok(out)
}

/// Header of a group blob payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    pub group_id: u32,
    pub read_ts: u64,
}

pub fn encode_blob_payload(header: BlobHeader, records: &[Record]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BLOB_HDR + records.len() * (FRAME_HDR + 16));
    let mut hdr = [0u8; BLOB_HDR];
    hdr[0..4].copy_from_slice(BLOB_MAGIC);
    LittleEndian::write_u32(&mut hdr[4..8], BLOB_VERSION);
    LittleEndian::write_u32(&mut hdr[8..12], header.group_id);
    LittleEndian::write_u64(&mut hdr[12..20], header.read_ts);
    out.extend_from_slice(&hdr);
    for r in records {
        encode_record(&mut out, &r.key, r.ts, r.value.as_deref());
    }
    out
}

pub fn decode_blob_payload(buf: &[u8]) -> Result<(BlobHeader, Vec<Record>)> {
    if buf.len() < BLOB_HDR || &buf[0..4] != BLOB_MAGIC {
        return Err(anyhow!("not a group blob (bad magic)"));
    }
    let version = LittleEndian::read_u32(&buf[4..8]);
    if version != BLOB_VERSION {
        return Err(anyhow!("unsupported group blob version {}", version));
    }
    let header = BlobHeader {
        group_id: LittleEndian::read_u32(&buf[8..12]),
        read_ts: LittleEndian::read_u64(&buf[12..20]),
    };
    let records = decode_records(&buf[BLOB_HDR..])?;
    Ok((header, records))
}
