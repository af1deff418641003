//! Store-level administrative operations.
//!
//! These only touch the store, so the operator CLI can run them against the
//! state file directly; the daemon wraps them with authorization checks.
//! Administrative writes to a managed record are forced (`Expect::Any`) or
//! conditional on the version just read; either way the version moves, so
//! an execution that was in flight loses its commit.

use crate::error::{LifecycleError, Result};
use crate::oracle::Identity;
use crate::policy::Policy;
use crate::slm::{SnapshotPolicy, SnapshotPolicyRecord, SnapshotStats};
use crate::state::{Explain, LifecycleState};
use crate::store::{Expect, LifecycleStore, MetaExt, RetentionStats, Subsystem};
use crate::types::{OperationMode, StepKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Attempts for read-modify-write loops on contended records.
const CAS_ATTEMPTS: usize = 5;

// ---------------------------------------------------------------------------
// ILM
// ---------------------------------------------------------------------------

pub fn explain(store: &dyn LifecycleStore, index: &str) -> Result<Explain> {
    Ok(match store.get_state(index)? {
        Some(state) => state.explain(),
        None => Explain::unmanaged(index),
    })
}

pub fn explain_all(store: &dyn LifecycleStore) -> Result<Vec<Explain>> {
    Ok(store.list_states()?.iter().map(LifecycleState::explain).collect())
}

fn managed(store: &dyn LifecycleStore, index: &str) -> Result<LifecycleState> {
    store
        .get_state(index)?
        .ok_or_else(|| LifecycleError::NotManaged(index.to_string()))
}

/// Re-arm an errored step. The failure counter is kept.
pub fn retry(store: &dyn LifecycleStore, index: &str) -> Result<LifecycleState> {
    let mut state = managed(store, index)?;
    let expect = Expect::Version(state.version);
    state.retry()?;
    let stored = store.put_state(&state, expect)?;
    info!(index, step = %stored.step, "retry requested");
    Ok(stored)
}

/// Force the pointer onto `target`. When `expected` is given the current step
/// must match it.
pub fn move_to_step(
    store: &dyn LifecycleStore,
    index: &str,
    expected: Option<&StepKey>,
    target: StepKey,
) -> Result<LifecycleState> {
    let mut state = managed(store, index)?;
    let policy = store
        .get_policy(&state.policy)?
        .ok_or_else(|| LifecycleError::PolicyNotFound(state.policy.clone()))?;
    let from = state.step.clone();
    state.force_move(&policy, expected, target, Utc::now())?;
    let stored = store.put_state(&state, Expect::Any)?;
    info!(index, from = %from, to = %stored.step, "moved to step");
    Ok(stored)
}

/// Store `policy` with `caller` as its execution identity.
pub fn set_policy(store: &dyn LifecycleStore, policy: &Policy, caller: &Identity) -> Result<Policy> {
    policy.validate()?;
    let mut policy = policy.clone();
    policy.identity = Some(caller.clone());
    let stored = store.put_policy(&policy)?;
    info!(policy = %stored.name, version = stored.version, "policy stored");
    Ok(stored)
}

pub fn get_policy(store: &dyn LifecycleStore, name: &str) -> Result<Policy> {
    store
        .get_policy(name)?
        .ok_or_else(|| LifecycleError::PolicyNotFound(name.to_string()))
}

/// Delete a policy. Rejected while any managed index still uses it.
pub fn delete_policy(store: &dyn LifecycleStore, name: &str) -> Result<()> {
    let users = store
        .list_states()?
        .iter()
        .filter(|s| s.policy == name)
        .count();
    if users > 0 {
        return Err(LifecycleError::PolicyInUse {
            policy: name.to_string(),
            count: users,
        });
    }
    if !store.delete_policy(name)? {
        return Err(LifecycleError::PolicyNotFound(name.to_string()));
    }
    Ok(())
}

/// Start managing `index` under `policy`. Binding again to the same policy is
/// a no-op; `identity` overrides the policy's execution identity.
pub fn bind(
    store: &dyn LifecycleStore,
    index: &str,
    policy: &str,
    identity: Option<Identity>,
    now: DateTime<Utc>,
) -> Result<LifecycleState> {
    let stored_policy = get_policy(store, policy)?;
    if let Some(existing) = store.get_state(index)? {
        if existing.policy == policy {
            return Ok(existing);
        }
        return Err(LifecycleError::AlreadyManaged {
            index: index.to_string(),
            policy: existing.policy,
        });
    }
    let identity = identity
        .or(stored_policy.identity)
        .ok_or_else(|| LifecycleError::InvalidPolicy {
            policy: policy.to_string(),
            reason: "policy has no execution identity; bind with an explicit identity"
                .to_string(),
        })?;
    let state = LifecycleState::new(index, policy, identity, now);
    let stored = store.put_state(&state, Expect::Absent)?;
    info!(index, policy, "index bound");
    Ok(stored)
}

pub fn unbind(store: &dyn LifecycleStore, index: &str) -> Result<()> {
    if !store.delete_state(index)? {
        return Err(LifecycleError::NotManaged(index.to_string()));
    }
    info!(index, "index unbound");
    Ok(())
}

/// Request a mode change. Stopping a running loop goes through `stopping`;
/// the loop itself settles on `stopped`.
pub fn set_operation_mode(
    store: &dyn LifecycleStore,
    subsystem: Subsystem,
    requested: OperationMode,
) -> Result<OperationMode> {
    let current = store.operation_mode(subsystem)?;
    let mode = match (current, requested) {
        (OperationMode::Running, OperationMode::Stopped) => OperationMode::Stopping,
        (OperationMode::Stopped, OperationMode::Stopping) => OperationMode::Stopped,
        (_, requested) => requested,
    };
    store.set_operation_mode(subsystem, mode)?;
    info!(subsystem = subsystem.as_str(), mode = %mode, "operation mode changed");
    Ok(mode)
}

// ---------------------------------------------------------------------------
// SLM
// ---------------------------------------------------------------------------

/// Read-modify-write a snapshot policy record, retrying on version conflicts.
pub fn update_snapshot_policy(
    store: &dyn LifecycleStore,
    id: &str,
    mut f: impl FnMut(&mut SnapshotPolicyRecord),
) -> Result<SnapshotPolicyRecord> {
    let mut last_err = None;
    for _ in 0..CAS_ATTEMPTS {
        let mut record = store
            .get_snapshot_policy(id)?
            .ok_or_else(|| LifecycleError::SnapshotPolicyNotFound(id.to_string()))?;
        let expect = Expect::Version(record.version);
        f(&mut record);
        match store.put_snapshot_policy(&record, expect) {
            Ok(stored) => return Ok(stored),
            Err(e @ LifecycleError::VersionConflict { .. }) => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| LifecycleError::Store(format!("could not update '{id}'"))))
}

/// Store a snapshot policy, keeping the metadata of an earlier version.
pub fn set_snapshot_policy(
    store: &dyn LifecycleStore,
    policy: &SnapshotPolicy,
    caller: &Identity,
) -> Result<SnapshotPolicyRecord> {
    policy.validate()?;
    let mut policy = policy.clone();
    policy.identity = Some(caller.clone());
    policy.modified_date = Utc::now();
    for _ in 0..CAS_ATTEMPTS {
        let existing = store.get_snapshot_policy(&policy.id)?;
        let (record, expect) = match existing {
            Some(mut record) => {
                policy.version = record.policy.version + 1;
                record.policy = policy.clone();
                let expect = Expect::Version(record.version);
                (record, expect)
            }
            None => {
                policy.version = 1;
                (SnapshotPolicyRecord::new(policy.clone()), Expect::Absent)
            }
        };
        match store.put_snapshot_policy(&record, expect) {
            Ok(stored) => {
                info!(policy = %stored.policy.id, version = stored.policy.version, "snapshot policy stored");
                return Ok(stored);
            }
            Err(LifecycleError::VersionConflict { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(LifecycleError::Store(format!(
        "could not store snapshot policy '{}'",
        policy.id
    )))
}

pub fn get_snapshot_policy(store: &dyn LifecycleStore, id: &str) -> Result<SnapshotPolicyRecord> {
    store
        .get_snapshot_policy(id)?
        .ok_or_else(|| LifecycleError::SnapshotPolicyNotFound(id.to_string()))
}

pub fn delete_snapshot_policy(store: &dyn LifecycleStore, id: &str) -> Result<()> {
    if !store.delete_snapshot_policy(id)? {
        return Err(LifecycleError::SnapshotPolicyNotFound(id.to_string()));
    }
    Ok(())
}

/// Ask the SLM loop to run `id` on its next tick.
pub fn request_snapshot(store: &dyn LifecycleStore, id: &str) -> Result<SnapshotPolicyRecord> {
    update_snapshot_policy(store, id, |record| record.metadata.execute_requested = true)
}

/// Ask the SLM loop to run a retention pass on its next tick.
pub fn request_retention(store: &dyn LifecycleStore) -> Result<()> {
    store.set_retention_requested(true)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlmStatsReport {
    #[serde(flatten)]
    pub retention: RetentionStats,
    #[serde(flatten)]
    pub totals: SnapshotStats,
    pub policy_stats: Vec<PolicyStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyStats {
    pub policy: String,
    #[serde(flatten)]
    pub stats: SnapshotStats,
}

pub fn slm_stats(store: &dyn LifecycleStore) -> Result<SlmStatsReport> {
    let mut report = SlmStatsReport {
        retention: store.retention_stats()?,
        ..Default::default()
    };
    for record in store.list_snapshot_policies()? {
        report.totals.add(&record.metadata.stats);
        report.policy_stats.push(PolicyStats {
            policy: record.policy.id.clone(),
            stats: record.metadata.stats.clone(),
        });
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
