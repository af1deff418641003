//! Executable steps and the classified outcome of running one.
//!
//! A step is a tagged `StepKind` (kind + parameters). Executing it never
//! raises: every result, including authorization denials, comes back as a
//! `StepOutcome` value whose error kind decides whether the orchestrator
//! retries automatically.

use crate::oracle::{Identity, Resource};
use crate::policy::RolloverConditions;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Privilege actions
// ---------------------------------------------------------------------------

pub const ACTION_INDEX_STATS: &str = "indices:monitor/stats";
pub const ACTION_ROLLOVER: &str = "indices:admin/rollover";
pub const ACTION_UPDATE_SETTINGS: &str = "indices:admin/settings/update";
pub const ACTION_DELETE_INDEX: &str = "indices:admin/delete";
pub const ACTION_CREATE_SNAPSHOT: &str = "cluster:admin/snapshot/create";
pub const ACTION_DELETE_SNAPSHOT: &str = "cluster:admin/snapshot/delete";

// ---------------------------------------------------------------------------
// StepKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Waits until the index meets one of the rollover conditions.
    CheckRolloverReady { conditions: RolloverConditions },
    /// Creates the next index in the series and moves the write alias to it.
    AttemptRollover,
    /// Marks the rolled-over index as no longer receiving writes.
    SetIndexingComplete,
    /// Reads index stats before deletion; only needs `monitor`.
    WaitForShardHistoryLeases,
    /// Deletes the index and, when asked, the snapshot backing it.
    DeleteIndex { delete_searchable_snapshot: bool },
    ReadOnly,
    SetPriority { priority: i64 },
    CreateSnapshot {
        policy: String,
        repository: String,
        snapshot: String,
        indices: Vec<String>,
        ignore_unavailable: bool,
        include_global_state: bool,
    },
    DeleteSnapshot { repository: String, snapshot: String },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::CheckRolloverReady { .. } => "check-rollover-ready",
            StepKind::AttemptRollover => "attempt-rollover",
            StepKind::SetIndexingComplete => "set-indexing-complete",
            StepKind::WaitForShardHistoryLeases => "wait-for-shard-history-leases",
            StepKind::DeleteIndex { .. } => "delete",
            StepKind::ReadOnly => "read-only",
            StepKind::SetPriority { .. } => "set-priority",
            StepKind::CreateSnapshot { .. } => "create-snapshot",
            StepKind::DeleteSnapshot { .. } => "delete-snapshot",
        }
    }

    /// Delete-type steps treat a missing target as already achieved.
    pub fn is_delete(&self) -> bool {
        matches!(self, StepKind::DeleteIndex { .. } | StepKind::DeleteSnapshot { .. })
    }

    /// Every (action, resource) pair the acting identity must be allowed before
    /// the side effect runs. `target` is the managed index for index steps.
    pub fn required_privileges(&self, target: &str) -> Vec<(&'static str, Resource)> {
        match self {
            StepKind::CheckRolloverReady { .. } | StepKind::WaitForShardHistoryLeases => {
                vec![(ACTION_INDEX_STATS, Resource::index(target))]
            }
            StepKind::AttemptRollover => vec![(ACTION_ROLLOVER, Resource::index(target))],
            StepKind::SetIndexingComplete | StepKind::ReadOnly | StepKind::SetPriority { .. } => {
                vec![(ACTION_UPDATE_SETTINGS, Resource::index(target))]
            }
            StepKind::DeleteIndex { .. } => vec![(ACTION_DELETE_INDEX, Resource::index(target))],
            StepKind::CreateSnapshot { indices, .. } => {
                let mut checks = vec![(ACTION_CREATE_SNAPSHOT, Resource::Cluster)];
                checks.extend(
                    indices
                        .iter()
                        .map(|index| (ACTION_INDEX_STATS, Resource::index(index))),
                );
                checks
            }
            StepKind::DeleteSnapshot { .. } => vec![(ACTION_DELETE_SNAPSHOT, Resource::Cluster)],
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    ResourceUnavailable,
    Timeout,
    PolicyInvalid,
    PolicyNotFound,
    PhaseNotFound,
    StepPreconditionFailed,
    NonRetryableExecutionError,
    /// An administrative override moved the resource while the step ran.
    Superseded,
}

impl ErrorKind {
    /// The single classification point for automatic retry.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorKind::PolicyInvalid | ErrorKind::NonRetryableExecutionError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PolicyInvalid => "policy_invalid",
            ErrorKind::PolicyNotFound => "policy_not_found",
            ErrorKind::PhaseNotFound => "phase_not_found",
            ErrorKind::StepPreconditionFailed => "step_precondition_failed",
            ErrorKind::NonRetryableExecutionError => "non_retryable_execution_error",
            ErrorKind::Superseded => "superseded",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// A classified step failure, persisted verbatim on the managed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {reason}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub reason: String,
    /// Privilege action that was denied, for `permission_denied`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_privileges: Vec<String>,
}

impl StepError {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            action: None,
            identity: None,
            resource: None,
            required_privileges: Vec::new(),
        }
    }

    pub fn permission_denied(
        action: &str,
        identity: &Identity,
        resource: &Resource,
        reason: impl Into<String>,
        required_privileges: Vec<String>,
    ) -> Self {
        Self {
            kind: ErrorKind::PermissionDenied,
            reason: reason.into(),
            action: Some(action.to_string()),
            identity: Some(identity.principal.clone()),
            resource: Some(resource.to_string()),
            required_privileges,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step's effect holds; the pointer may advance.
    Complete,
    /// A condition step is not satisfied yet. Not an error.
    Waiting { info: serde_json::Value },
    /// The step removed the managed resource itself.
    Removed,
    Failed(StepError),
}

impl StepOutcome {
    pub fn failed(kind: ErrorKind, reason: impl Into<String>) -> Self {
        StepOutcome::Failed(StepError::new(kind, reason))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Complete | StepOutcome::Removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
