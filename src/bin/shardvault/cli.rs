use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Offline tools for shardvault backup locations
#[derive(Parser, Debug)]
#[command(name = "shardvault", version, about = "shardvault backup/restore CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as Parser>::parse()
    }
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Restore a backup chain into fresh per-group directories (p1, p2, ...)
    Restore {
        /// Backup location (directory)
        #[arg(long)]
        location: PathBuf,
        /// Destination root; must be empty unless --incremental-from is set
        #[arg(long)]
        dest: PathBuf,
        /// Backup series to restore (default: the most recent one)
        #[arg(long)]
        backup_id: Option<String>,
        /// Stop after this backup number (0 or omitted = latest)
        #[arg(long, allow_negative_numbers = true, conflicts_with = "commit_ts")]
        backup_num: Option<i64>,
        /// Replay every backup with readTs <= this commit timestamp
        #[arg(long)]
        commit_ts: Option<u64>,
        /// Key file for encrypted backups
        #[arg(long)]
        encryption_key_file: Option<PathBuf>,
        /// Apply only backups >= N on top of an existing restore in --dest
        #[arg(long)]
        incremental_from: Option<u64>,
        /// Print the result as one JSON object
        #[arg(long)]
        json: bool,
    },
    /// List committed backups of a location
    ListBackups {
        #[arg(long)]
        location: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Validate a chain and decode every blob it references (no writes)
    Verify {
        #[arg(long)]
        location: PathBuf,
        #[arg(long)]
        backup_id: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        backup_num: Option<i64>,
        #[arg(long)]
        encryption_key_file: Option<PathBuf>,
    },
    /// Show what a restored group directory holds
    Inspect {
        /// Group directory (e.g. <dest>/p1)
        #[arg(long)]
        path: PathBuf,
    },
}
