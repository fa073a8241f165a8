//! admin: the operator-facing surface around backup and restore.
//!
//! - list_backups(): every committed event of a location, listing shape.
//! - TaskRegistry: backups run on worker threads; callers poll a task id.
//!   Finished tasks are kept for a retention period, then evicted.
//! - BackupResponse / RestoreResponse: `{code, ...}` replies with code
//!   "Success" or "Failure".

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::backup::{run_backup, BackupRequest};
use crate::blob::BlobStore;
use crate::cluster::Cluster;
use crate::config::BackupConfig;
use crate::manifest::read_manifest_log;
use crate::restore::RestoreSummary;

pub const CODE_SUCCESS: &str = "Success";
pub const CODE_FAILURE: &str = "Failure";

/// How long a finished task stays pollable.
pub const DEFAULT_TASK_RETENTION: Duration = Duration::from_secs(600);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupListing {
    pub group_id: u32,
    pub predicates: BTreeSet<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupListing {
    pub backup_id: String,
    pub backup_num: u64,
    pub encrypted: bool,
    pub groups: Vec<GroupListing>,
    pub path: String,
    pub since: u64,
    pub read_ts: u64,
    #[serde(rename = "type")]
    pub backup_type: String,
}

/// Committed backups of a location in commit order.
pub fn list_backups(blob: &dyn BlobStore) -> Result<Vec<BackupListing>> {
    let log = read_manifest_log(blob)?;
    Ok(log
        .manifests
        .iter()
        .map(|m| BackupListing {
            backup_id: m.backup_id.clone(),
            backup_num: m.backup_num,
            encrypted: m.encrypted,
            groups: m
                .manifests
                .values()
                .map(|g| GroupListing {
                    group_id: g.group_id,
                    predicates: g.predicates.clone(),
                })
                .collect(),
            path: m.path.clone(),
            since: m.since,
            read_ts: m.read_ts,
            backup_type: m.backup_type.as_str().to_string(),
        })
        .collect())
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupResponse {
    pub code: String,
    pub task_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResponse {
    pub code: String,
    pub message: String,
}

impl RestoreResponse {
    pub fn from_result(r: &Result<RestoreSummary>) -> Self {
        match r {
            Ok(s) => Self {
                code: CODE_SUCCESS.to_string(),
                message: format!(
                    "restored {} up to backup {} ({} groups, max_ts={})",
                    s.backup_id,
                    s.backup_num,
                    s.groups.len(),
                    s.max_ts
                ),
            },
            Err(e) => Self {
                code: CODE_FAILURE.to_string(),
                message: format!("{:#}", e),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Success {
        backup_id: String,
        backup_num: u64,
        read_ts: u64,
    },
    Failed(String),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success { .. } | TaskStatus::Failed(_))
    }
}

struct TaskEntry {
    status: TaskStatus,
    started_ms: u64,
    finished_ms: Option<u64>,
}

/// Background backup tasks, addressed by "0x..." ids.
#[derive(Clone)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<String, TaskEntry>>>,
    next: Arc<AtomicU64>,
    retention: Duration,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self {
            tasks: Arc::default(),
            next: Arc::default(),
            retention: DEFAULT_TASK_RETENTION,
        }
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, TaskEntry>> {
        match self.tasks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_status(&self, id: &str, status: TaskStatus) {
        if let Some(t) = self.tasks().get_mut(id) {
            if status.is_terminal() {
                t.finished_ms = Some(crate::util::now_unix_ms());
            }
            t.status = status;
        }
    }

    /// Drop finished tasks older than `older_than`. Running tasks stay.
    pub fn evict_finished(&self, older_than: Duration) -> usize {
        let now = crate::util::now_unix_ms();
        let limit = older_than.as_millis() as u64;
        let mut tasks = self.tasks();
        let before = tasks.len();
        tasks.retain(|_, t| match t.finished_ms {
            Some(done) => now.saturating_sub(done) < limit,
            None => true,
        });
        let evicted = before - tasks.len();
        if evicted > 0 {
            debug!("task: evicted {} finished tasks", evicted);
        }
        evicted
    }

    /// Queue a backup; it starts on its own thread immediately.
    pub fn submit_backup(
        &self,
        cluster: Arc<Cluster>,
        blob: Arc<dyn BlobStore>,
        req: BackupRequest,
        cfg: BackupConfig,
    ) -> Result<BackupResponse> {
        self.evict_finished(self.retention);
        let id = format!("0x{:x}", self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.tasks().insert(
            id.clone(),
            TaskEntry {
                status: TaskStatus::Queued,
                started_ms: crate::util::now_unix_ms(),
                finished_ms: None,
            },
        );

        let force_full = req.force_full;
        let registry = self.clone();
        let task_id = id.clone();
        thread::Builder::new()
            .name(format!("backup-{}", id))
            .spawn(move || {
                registry.set_status(&task_id, TaskStatus::Running);
                let status = match run_backup(&cluster, blob.as_ref(), &req, &cfg) {
                    Ok(m) => TaskStatus::Success {
                        backup_id: m.backup_id,
                        backup_num: m.backup_num,
                        read_ts: m.read_ts,
                    },
                    Err(e) => {
                        warn!("task {}: backup failed: {:#}", task_id, e);
                        TaskStatus::Failed(format!("{:#}", e))
                    }
                };
                registry.set_status(&task_id, status);
            })
            .map_err(|e| anyhow!("spawn backup task {}: {}", id, e))?;

        info!("task {}: backup submitted, force_full={}", id, force_full);
        Ok(BackupResponse {
            code: CODE_SUCCESS.to_string(),
            task_id: id,
        })
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.tasks().get(id).map(|t| t.status.clone())
    }

    /// Milliseconds since the task was submitted.
    pub fn age_ms(&self, id: &str) -> Option<u64> {
        self.tasks()
            .get(id)
            .map(|t| crate::util::now_unix_ms().saturating_sub(t.started_ms))
    }

    /// Poll until the task is terminal or `timeout` passes.
    pub fn wait(&self, id: &str, poll: Duration, timeout: Duration) -> Result<TaskStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let st = self
                .status(id)
                .ok_or_else(|| anyhow!("unknown task {}", id))?;
            if st.is_terminal() {
                return Ok(st);
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("task {} still {:?} after {:?}", id, st, timeout));
            }
            thread::sleep(poll);
        }
    }
}
