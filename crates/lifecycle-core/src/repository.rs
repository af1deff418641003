//! Snapshot repository collaborator.
//!
//! Snapshot storage is external; SLM only creates, deletes, lists and polls
//! snapshots. `MemoryRepository` keeps snapshots in process and completes an
//! in-progress snapshot the next time it is observed.

use crate::engine::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotState {
    InProgress,
    Success,
    Failed,
}

impl SnapshotState {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotState::InProgress => "IN_PROGRESS",
            SnapshotState::Success => "SUCCESS",
            SnapshotState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub repository: String,
    /// Snapshot policy that created it, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    pub state: SnapshotState,
    pub start_time: DateTime<Utc>,
    pub indices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub repository: String,
    pub snapshot: String,
    pub policy: Option<String>,
    pub indices: Vec<String>,
    pub ignore_unavailable: bool,
    pub include_global_state: bool,
}

pub trait SnapshotRepository: Send + Sync {
    fn create_snapshot(&self, request: &SnapshotRequest) -> EngineResult<SnapshotInfo>;
    fn delete_snapshot(&self, repository: &str, snapshot: &str) -> EngineResult<()>;
    fn snapshot_status(&self, repository: &str, snapshot: &str) -> EngineResult<SnapshotInfo>;
    fn list_snapshots(&self, repository: &str) -> EngineResult<Vec<SnapshotInfo>>;
}

// ---------------------------------------------------------------------------
// MemoryRepository
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Repositories {
    /// repository → snapshot name → info
    snapshots: BTreeMap<String, BTreeMap<String, SnapshotInfo>>,
    fail_next: bool,
    unavailable: bool,
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    inner: Mutex<Repositories>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an (empty) repository.
    pub fn add_repository(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.snapshots.entry(name.to_string()).or_default();
    }

    /// The next snapshot created ends in `FAILED`.
    pub fn fail_next_snapshot(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.fail_next = true;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.unavailable = unavailable;
    }

    /// Insert a snapshot as-is, for retention tests that need old snapshots.
    pub fn insert_snapshot(&self, info: SnapshotInfo) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .snapshots
            .entry(info.repository.clone())
            .or_default()
            .insert(info.name.clone(), info);
    }

    fn with_repo<T>(
        &self,
        repository: &str,
        f: impl FnOnce(&mut BTreeMap<String, SnapshotInfo>, &mut bool) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.unavailable {
            return Err(EngineError::Unavailable(
                "snapshot repository is not reachable".to_string(),
            ));
        }
        let Repositories {
            snapshots,
            fail_next,
            ..
        } = &mut *inner;
        let repo = snapshots
            .get_mut(repository)
            .ok_or_else(|| EngineError::NotFound(format!("repository {repository}")))?;
        // In-progress snapshots finish once observed.
        for info in repo.values_mut() {
            if info.state == SnapshotState::InProgress {
                info.state = SnapshotState::Success;
            }
        }
        f(repo, fail_next)
    }
}

impl SnapshotRepository for MemoryRepository {
    fn create_snapshot(&self, request: &SnapshotRequest) -> EngineResult<SnapshotInfo> {
        self.with_repo(&request.repository, |repo, fail_next| {
            if repo.contains_key(&request.snapshot) {
                return Err(EngineError::Failed(format!(
                    "snapshot with the same name [{}] already exists",
                    request.snapshot
                )));
            }
            let state = if std::mem::take(fail_next) {
                SnapshotState::Failed
            } else {
                SnapshotState::InProgress
            };
            let info = SnapshotInfo {
                name: request.snapshot.clone(),
                repository: request.repository.clone(),
                policy: request.policy.clone(),
                state,
                start_time: Utc::now(),
                indices: request.indices.clone(),
            };
            repo.insert(info.name.clone(), info.clone());
            Ok(info)
        })
    }

    fn delete_snapshot(&self, repository: &str, snapshot: &str) -> EngineResult<()> {
        self.with_repo(repository, |repo, _| {
            repo.remove(snapshot)
                .map(|_| ())
                .ok_or_else(|| EngineError::NotFound(format!("{repository}:{snapshot}")))
        })
    }

    fn snapshot_status(&self, repository: &str, snapshot: &str) -> EngineResult<SnapshotInfo> {
        self.with_repo(repository, |repo, _| {
            repo.get(snapshot)
                .cloned()
                .ok_or_else(|| EngineError::NotFound(format!("{repository}:{snapshot}")))
        })
    }

    fn list_snapshots(&self, repository: &str) -> EngineResult<Vec<SnapshotInfo>> {
        self.with_repo(repository, |repo, _| {
            let mut all: Vec<SnapshotInfo> = repo.values().cloned().collect();
            all.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.name.cmp(&b.name)));
            Ok(all)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
