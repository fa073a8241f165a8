//! store: per-group multi-version key/value state.
//!
//! Stand-in for the engine a group keeps its tablets in: every key carries a
//! map commit_ts -> value (None = tombstone). A read at ts sees the latest
//! version with commit_ts <= ts.
//!
//! Keys:
//! - Data   (attr = predicate, uid) : one predicate value of one node
//! - Schema (attr = predicate)      : declared type of a predicate
//! - Type   (attr = type name)      : type definition (comma-separated fields)
//!
//! On disk (MvccStore):
//!   <root>/GROUP_ID  decimal group id, the tag restore verification reads back
//!   <root>/data.bin  "SVDATA1\0" + record frames (see codec)
//!   <root>/LOCK      fs2 lock held while the store is open

use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::lock::{try_lock_store, StoreLock};

pub mod codec;
pub use codec::Record;

const DATA_FILE: &str = "data.bin";
const GROUP_ID_FILE: &str = "GROUP_ID";
const DATA_MAGIC: &[u8; 8] = b"SVDATA1\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum KeyKind {
    Data = 0,
    Schema = 1,
    Type = 2,
}

impl KeyKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(KeyKind::Data),
            1 => Some(KeyKind::Schema),
            2 => Some(KeyKind::Type),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub kind: KeyKind,
    pub attr: String,
    pub uid: u64,
}

impl Key {
    pub fn data<S: Into<String>>(attr: S, uid: u64) -> Self {
        Self { kind: KeyKind::Data, attr: attr.into(), uid }
    }

    pub fn schema<S: Into<String>>(attr: S) -> Self {
        Self { kind: KeyKind::Schema, attr: attr.into(), uid: 0 }
    }

    pub fn type_def<S: Into<String>>(name: S) -> Self {
        Self { kind: KeyKind::Type, attr: name.into(), uid: 0 }
    }

    /// Data and schema keys belong to a predicate (tablet); type keys do not.
    #[inline]
    pub fn predicate(&self) -> Option<&str> {
        match self.kind {
            KeyKind::Data | KeyKind::Schema => Some(&self.attr),
            KeyKind::Type => None,
        }
    }
}

pub type Versions = BTreeMap<u64, Option<Vec<u8>>>;

/// All versions of all keys of one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupState {
    entries: BTreeMap<Key, Versions>,
}

impl GroupState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn version_count(&self) -> usize {
        self.entries.values().map(|v| v.len()).sum()
    }

    pub fn put(&mut self, key: Key, ts: u64, value: Option<Vec<u8>>) {
        self.entries.entry(key).or_default().insert(ts, value);
    }

    pub fn apply(&mut self, rec: Record) {
        self.put(rec.key, rec.ts, rec.value);
    }

    /// Latest live value with commit_ts <= read_ts.
    pub fn get_at(&self, key: &Key, read_ts: u64) -> Option<&[u8]> {
        let versions = self.entries.get(key)?;
        let (_, v) = versions.range(..=read_ts).next_back()?;
        v.as_deref()
    }

    pub fn max_ts(&self) -> u64 {
        self.entries
            .values()
            .filter_map(|v| v.keys().next_back().copied())
            .max()
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Versions)> {
        self.entries.iter()
    }

    /// Every version with since < ts <= until, in key order.
    pub fn records_between(&self, since: u64, until: u64) -> Vec<Record> {
        let mut out = Vec::new();
        if until <= since {
            return out;
        }
        for (k, versions) in &self.entries {
            for (ts, v) in versions.range(since + 1..=until) {
                out.push(Record { key: k.clone(), ts: *ts, value: v.clone() });
            }
        }
        out
    }

    /// Every version (ts <= until) of the data and schema keys of one predicate.
    pub fn predicate_records_until(&self, attr: &str, until: u64) -> Vec<Record> {
        let mut out = Vec::new();
        for (k, versions) in &self.entries {
            if k.predicate() != Some(attr) {
                continue;
            }
            for (ts, v) in versions.range(..=until) {
                out.push(Record { key: k.clone(), ts: *ts, value: v.clone() });
            }
        }
        out
    }

    pub fn retain<F: FnMut(&Key) -> bool>(&mut self, mut keep: F) {
        self.entries.retain(|k, _| keep(k));
    }

    /// Remove and return every key of one predicate (used by tablet moves).
    pub fn take_predicate(&mut self, attr: &str) -> BTreeMap<Key, Versions> {
        let keys: Vec<Key> = self
            .entries
            .keys()
            .filter(|k| k.predicate() == Some(attr))
            .cloned()
            .collect();
        let mut out = BTreeMap::new();
        for k in keys {
            if let Some(v) = self.entries.remove(&k) {
                out.insert(k, v);
            }
        }
        out
    }

    pub fn merge_versions(&mut self, taken: BTreeMap<Key, Versions>) {
        for (k, versions) in taken {
            self.entries.entry(k).or_default().extend(versions);
        }
    }

    /// Predicates with a live schema entry at read_ts.
    pub fn predicates(&self, read_ts: u64) -> BTreeSet<String> {
        self.live_names(KeyKind::Schema, read_ts)
    }

    /// Types with a live definition at read_ts.
    pub fn types(&self, read_ts: u64) -> BTreeSet<String> {
        self.live_names(KeyKind::Type, read_ts)
    }

    fn live_names(&self, kind: KeyKind, read_ts: u64) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .filter(|(k, _)| self.get_at(k, read_ts).is_some())
            .map(|(k, _)| k.attr.clone())
            .collect()
    }

    /// Declared type of a predicate at read_ts.
    pub fn schema_of(&self, attr: &str, read_ts: u64) -> Option<String> {
        self.get_at(&Key::schema(attr), read_ts)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// uid -> value of one predicate at read_ts (tombstoned uids omitted).
    pub fn predicate_values(&self, attr: &str, read_ts: u64) -> BTreeMap<u64, Vec<u8>> {
        let lo = Key::data(attr, 0);
        let hi = Key::data(attr, u64::MAX);
        let mut out = BTreeMap::new();
        for (k, _) in self.entries.range(lo..=hi) {
            if let Some(v) = self.get_at(k, read_ts) {
                out.insert(k.uid, v.to_vec());
            }
        }
        out
    }

    fn to_frames(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (k, versions) in &self.entries {
            for (ts, v) in versions {
                codec::encode_record(&mut out, k, *ts, v.as_deref());
            }
        }
        out
    }

    fn from_records(records: Vec<Record>) -> Self {
        let mut s = Self::new();
        for r in records {
            s.apply(r);
        }
        s
    }
}

/// A group's state persisted in its own directory, tagged with the group id.
pub struct MvccStore {
    root: PathBuf,
    group_id: u32,
    state: GroupState,
    _lock: StoreLock,
}

impl MvccStore {
    /// Create a fresh store. The directory must be absent or empty.
    pub fn create(root: &Path, group_id: u32) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
        let mut entries = fs::read_dir(root).with_context(|| format!("read_dir {}", root.display()))?;
        if entries.next().is_some() {
            return Err(anyhow!(
                "store directory {} is not empty; restore needs a fresh directory",
                root.display()
            ));
        }
        let lock = try_lock_store(root)?;
        write_group_id(root, group_id)?;
        let store = Self {
            root: root.to_path_buf(),
            group_id,
            state: GroupState::new(),
            _lock: lock,
        };
        store.flush()?;
        Ok(store)
    }

    /// Open an existing store (GROUP_ID + data.bin).
    pub fn open(root: &Path) -> Result<Self> {
        let group_id = read_group_id(root)?;
        let lock = try_lock_store(root)?;
        let path = root.join(DATA_FILE);
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        if bytes.len() < DATA_MAGIC.len() || &bytes[..DATA_MAGIC.len()] != DATA_MAGIC {
            return Err(anyhow!("{}: bad magic", path.display()));
        }
        let records = codec::decode_records(&bytes[DATA_MAGIC.len()..])
            .with_context(|| format!("decode {}", path.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            group_id,
            state: GroupState::from_records(records),
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    pub fn state(&self) -> &GroupState {
        &self.state
    }

    pub fn replace_state(&mut self, state: GroupState) {
        self.state = state;
    }

    pub fn take_state(&mut self) -> GroupState {
        std::mem::take(&mut self.state)
    }

    pub fn get_at(&self, key: &Key, read_ts: u64) -> Option<&[u8]> {
        self.state.get_at(key, read_ts)
    }

    /// Persist the whole state (tmp + rename).
    pub fn flush(&self) -> Result<()> {
        let path = self.root.join(DATA_FILE);
        let tmp = self.root.join(format!("{}.tmp", DATA_FILE));
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .with_context(|| format!("open {}", tmp.display()))?;
            f.write_all(DATA_MAGIC)?;
            f.write_all(&self.state.to_frames())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }
}

pub fn write_group_id(root: &Path, group_id: u32) -> Result<()> {
    let path = root.join(GROUP_ID_FILE);
    fs::write(&path, format!("{}\n", group_id))
        .with_context(|| format!("write {}", path.display()))
}

/// Group id a store directory is tagged with.
pub fn read_group_id(root: &Path) -> Result<u32> {
    let path = root.join(GROUP_ID_FILE);
    let s = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    s.trim()
        .parse::<u32>()
        .map_err(|e| anyhow!("{}: invalid group id '{}': {}", path.display(), s.trim(), e))
}
