//! blob: the storage a backup location lives on.
//!
//! Backup and restore only need list/get/put over '/'-separated relative paths.
//! FsBlobStore maps them onto a local directory; object stores plug in behind
//! the same trait.
//!
//! Writes are whole-object and atomic (tmp + rename): a reader sees the old
//! object or the new one, never a torn one. The writer never edits an object
//! in place except the root manifest.json, which it replaces in one put.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub trait BlobStore: Send + Sync {
    /// Human-readable location, also the key of the in-flight backup slot.
    fn location(&self) -> String;

    /// Relative paths of all objects starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Object bytes, or None if absent.
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Create or replace an object atomically.
    fn put(&self, path: &str, bytes: &[u8]) -> Result<()>;

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.get(path)?.is_some())
    }
}

/// Local filesystem backup location.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (creating if needed) a directory as a backup location.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("create backup location {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() || path.starts_with('/') {
            return Err(anyhow!("invalid blob path '{}'", path));
        }
        let mut p = self.root.clone();
        for part in path.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(anyhow!("invalid blob path '{}'", path));
            }
            p.push(part);
        }
        Ok(p)
    }

    fn walk(&self, dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir).with_context(|| format!("read_dir {}", dir.display()))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".tmp") {
                continue;
            }
            let child = if rel.is_empty() {
                name
            } else {
                format!("{}/{}", rel, name)
            };
            if entry.file_type()?.is_dir() {
                self.walk(&entry.path(), &child, out)?;
            } else {
                out.push(child);
            }
        }
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        if self.root.exists() {
            self.walk(&self.root, "", &mut out)?;
        }
        out.retain(|p| p.starts_with(prefix));
        out.sort();
        Ok(out)
    }

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let p = self.resolve(path)?;
        match fs::read(&p) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read blob {}", p.display())),
        }
    }

    fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let p = self.resolve(path)?;
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let tmp = p.with_extension("tmp");
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .with_context(|| format!("open tmp {}", tmp.display()))?;
            f.write_all(bytes)
                .with_context(|| format!("write {}", tmp.display()))?;
            f.sync_all()
                .with_context(|| format!("fsync {}", tmp.display()))?;
        }
        fs::rename(&tmp, &p)
            .with_context(|| format!("rename {} -> {}", tmp.display(), p.display()))?;
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.is_file())
    }
}
