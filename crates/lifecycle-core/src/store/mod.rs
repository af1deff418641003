//! The store is the single source of truth for lifecycle progress.
//!
//! Managed records and snapshot policy records are written conditionally:
//! the caller names the version it read (`Expect`) and the write fails with
//! `VersionConflict` if someone else wrote in between. Lifecycle policies
//! are replaced wholesale and get a fresh version on every put.

mod db;
mod memory;

pub use db::RedbStore;
pub use memory::MemoryStore;

use crate::error::{LifecycleError, Result};
use crate::paths;
use crate::policy::Policy;
use crate::slm::SnapshotPolicyRecord;
use crate::state::LifecycleState;
use crate::types::OperationMode;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Expect
// ---------------------------------------------------------------------------

/// Precondition of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// The key must not exist yet.
    Absent,
    /// The stored record must carry exactly this version.
    Version(u64),
    /// Overwrite whatever is there. Used by administrative overrides.
    Any,
}

/// Version the written record gets, or the conflict.
pub(crate) fn next_version(key: &str, expect: Expect, found: Option<u64>) -> Result<u64> {
    let ok = match (expect, found) {
        (Expect::Any, _) => true,
        (Expect::Absent, None) => true,
        (Expect::Version(v), Some(f)) => v == f,
        _ => false,
    };
    if !ok {
        return Err(LifecycleError::VersionConflict {
            key: key.to_string(),
            expected: match expect {
                Expect::Version(v) => v,
                _ => 0,
            },
            found: found.unwrap_or(0),
        });
    }
    Ok(found.map_or(1, |v| v + 1))
}

// ---------------------------------------------------------------------------
// LifecycleStore
// ---------------------------------------------------------------------------

pub trait LifecycleStore: Send + Sync {
    fn get_state(&self, index: &str) -> Result<Option<LifecycleState>>;
    fn list_states(&self) -> Result<Vec<LifecycleState>>;
    /// Conditional write; returns the record as stored (with its new version).
    fn put_state(&self, state: &LifecycleState, expect: Expect) -> Result<LifecycleState>;
    fn delete_state(&self, index: &str) -> Result<bool>;

    fn get_policy(&self, name: &str) -> Result<Option<Policy>>;
    fn list_policies(&self) -> Result<Vec<Policy>>;
    /// Replace the policy; the stored copy gets the next version and a fresh
    /// `modified_date`.
    fn put_policy(&self, policy: &Policy) -> Result<Policy>;
    fn delete_policy(&self, name: &str) -> Result<bool>;

    fn get_snapshot_policy(&self, id: &str) -> Result<Option<SnapshotPolicyRecord>>;
    fn list_snapshot_policies(&self) -> Result<Vec<SnapshotPolicyRecord>>;
    fn put_snapshot_policy(
        &self,
        record: &SnapshotPolicyRecord,
        expect: Expect,
    ) -> Result<SnapshotPolicyRecord>;
    fn delete_snapshot_policy(&self, id: &str) -> Result<bool>;

    fn get_meta(&self, key: &str) -> Result<Option<serde_json::Value>>;
    fn put_meta(&self, key: &str, value: &serde_json::Value) -> Result<()>;
}

/// Open the on-disk store under `root/.lifecycle/`.
pub fn open(root: &Path) -> Result<RedbStore> {
    paths::ensure_initialized(root)?;
    RedbStore::open(&paths::store_path(root))
}

// ---------------------------------------------------------------------------
// Typed meta entries
// ---------------------------------------------------------------------------

pub const META_ILM_MODE: &str = "ilm_mode";
pub const META_SLM_MODE: &str = "slm_mode";
pub const META_RETENTION_REQUESTED: &str = "retention_requested";
pub const META_LAST_RETENTION: &str = "last_retention";
pub const META_RETENTION_STATS: &str = "retention_stats";

/// Which loop an operation mode belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Ilm,
    Slm,
}

impl Subsystem {
    fn meta_key(self) -> &'static str {
        match self {
            Subsystem::Ilm => META_ILM_MODE,
            Subsystem::Slm => META_SLM_MODE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Subsystem::Ilm => "ilm",
            Subsystem::Slm => "slm",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionStats {
    pub retention_runs: u64,
    pub retention_failed: u64,
    pub retention_timed_out: u64,
    pub retention_deletion_time_millis: u64,
}

/// Typed accessors over the `meta` table.
pub trait MetaExt {
    fn meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>>;
    fn set_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<()>;

    fn operation_mode(&self, subsystem: Subsystem) -> Result<OperationMode> {
        Ok(self.meta(subsystem.meta_key())?.unwrap_or_default())
    }

    fn set_operation_mode(&self, subsystem: Subsystem, mode: OperationMode) -> Result<()> {
        self.set_meta(subsystem.meta_key(), &mode)
    }

    fn retention_requested(&self) -> Result<bool> {
        Ok(self.meta(META_RETENTION_REQUESTED)?.unwrap_or(false))
    }

    fn set_retention_requested(&self, requested: bool) -> Result<()> {
        self.set_meta(META_RETENTION_REQUESTED, &requested)
    }

    fn last_retention(&self) -> Result<Option<DateTime<Utc>>> {
        self.meta(META_LAST_RETENTION)
    }

    fn set_last_retention(&self, at: DateTime<Utc>) -> Result<()> {
        self.set_meta(META_LAST_RETENTION, &at)
    }

    fn retention_stats(&self) -> Result<RetentionStats> {
        Ok(self.meta(META_RETENTION_STATS)?.unwrap_or_default())
    }

    fn set_retention_stats(&self, stats: &RetentionStats) -> Result<()> {
        self.set_meta(META_RETENTION_STATS, stats)
    }
}

impl<S: LifecycleStore + ?Sized> MetaExt for S {
    fn meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_meta(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn set_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.put_meta(key, &serde_json::to_value(value)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
