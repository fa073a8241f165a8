//! Centralized configuration and builder for backup/restore.
//!
//! Goals:
//! - One place for tunables instead of env lookups scattered through the writer/replayer.
//! - BackupConfig::from_env() reads SV_* variables; fluent with_*() setters override them.
//!
//! Env:
//! - SV_COMPRESSION_LEVEL     zstd level for group blobs (default 3)
//! - SV_ENCRYPTION_KEY_FILE   key file for encrypted backups (default none)
//! - SV_RESTORE_CONFIRMATIONS consecutive successful probes after an online restore (default 3)
//! - SV_RESTORE_POLL_MS       delay between probes (default 1000)
//! - SV_RESTORE_MAX_POLLS     give up after this many probes (default 120)
//! - SV_VERIFY_BLOBS          fail a restore up front if a resolved entry's blob is missing (default on)

use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct BackupConfig {
    /// zstd compression level used for group blobs.
    pub compression_level: i32,

    /// Key file used when writing backups. None = unencrypted backups.
    pub encryption_key_file: Option<PathBuf>,

    /// How many reads in a row must succeed before an online restore counts as visible.
    pub restore_confirmations: u32,

    /// Probe interval while waiting for an online restore, in milliseconds.
    pub restore_poll_ms: u64,

    /// Upper bound on probes while waiting for an online restore.
    pub restore_max_polls: u32,

    /// Check that every group blob of the resolved chain exists before writing.
    pub verify_blobs: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            compression_level: 3,
            encryption_key_file: None,
            restore_confirmations: 3,
            restore_poll_ms: 1000,
            restore_max_polls: 120,
            verify_blobs: true,
        }
    }
}

impl BackupConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SV_COMPRESSION_LEVEL") {
            if let Ok(n) = v.trim().parse::<i32>() {
                cfg.compression_level = n;
            }
        }

        if let Ok(v) = std::env::var("SV_ENCRYPTION_KEY_FILE") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.encryption_key_file = Some(PathBuf::from(s));
            }
        }

        if let Ok(v) = std::env::var("SV_RESTORE_CONFIRMATIONS") {
            if let Ok(n) = v.trim().parse::<u32>() {
                cfg.restore_confirmations = n.max(1);
            }
        }

        if let Ok(v) = std::env::var("SV_RESTORE_POLL_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.restore_poll_ms = n;
            }
        }

        if let Ok(v) = std::env::var("SV_RESTORE_MAX_POLLS") {
            if let Ok(n) = v.trim().parse::<u32>() {
                cfg.restore_max_polls = n;
            }
        }

        if let Ok(v) = std::env::var("SV_VERIFY_BLOBS") {
            let s = v.trim().to_ascii_lowercase();
            cfg.verify_blobs = !(s == "0" || s == "false" || s == "off" || s == "no");
        }

        cfg
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn with_encryption_key_file<P: Into<PathBuf>>(mut self, path: Option<P>) -> Self {
        self.encryption_key_file = path.map(Into::into);
        self
    }

    pub fn with_restore_confirmations(mut self, n: u32) -> Self {
        self.restore_confirmations = n.max(1);
        self
    }

    pub fn with_restore_poll_ms(mut self, ms: u64) -> Self {
        self.restore_poll_ms = ms;
        self
    }

    pub fn with_restore_max_polls(mut self, n: u32) -> Self {
        self.restore_max_polls = n;
        self
    }

    pub fn with_verify_blobs(mut self, on: bool) -> Self {
        self.verify_blobs = on;
        self
    }
}

impl fmt::Display for BackupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BackupConfig {{ compression_level: {}, encryption_key_file: {}, restore_confirmations: {}, restore_poll_ms: {}, restore_max_polls: {}, verify_blobs: {} }}",
            self.compression_level,
            self.encryption_key_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string()),
            self.restore_confirmations,
            self.restore_poll_ms,
            self.restore_max_polls,
            self.verify_blobs
        )
    }
}
