// Ambient
pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod util;   // src/util/mod.rs

// Crypto + blob storage of backup locations
pub mod crypto; // src/crypto/mod.rs
pub mod blob;   // src/blob/mod.rs

// Storage engine stand-in and the live cluster it belongs to
pub mod store;   // src/store/{mod,codec}.rs
pub mod cluster; // src/cluster/{mod,group,oracle}.rs

// Backup chain: model, validation, writer, replayer
pub mod manifest; // src/manifest/{mod,io}.rs
pub mod chain;
pub mod backup;   // src/backup/{mod,stream}.rs
pub mod restore;  // src/restore/{mod,reconcile,online}.rs

// Listing, tasks, request/response shapes
pub mod admin;

// Re-exports
pub use backup::{run_backup, BackupRequest};
pub use blob::{BlobStore, FsBlobStore};
pub use chain::{resolve, RestoreTarget};
pub use cluster::{Cluster, LocalOracle, TimestampOracle};
pub use config::BackupConfig;
pub use crypto::EncryptionKey;
pub use error::{classify, BackupError};
pub use manifest::{BackupType, DropKind, DropRecord, Manifest, MasterManifest};
pub use restore::{
    run_offline_restore, run_online_restore, wait_for_restore, RestoreOptions, RestorePoint,
    RestoreSummary,
};
