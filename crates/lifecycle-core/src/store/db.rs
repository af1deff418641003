//! redb-backed store.
//!
//! # Table design
//!
//! Four tables, all `&str → &[u8]` with JSON values:
//! ```text
//! lifecycle_states   index name       → LifecycleState
//! policies           policy name      → Policy
//! snapshot_policies  policy id        → SnapshotPolicyRecord
//! meta               key              → arbitrary JSON
//! ```
//!
//! Every record carries a top-level `version` field. Conditional writes
//! compare it inside a single write transaction, which redb serializes, so
//! the check-and-set is atomic across threads and processes.

use std::fmt::Display;
use std::path::Path;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{LifecycleError, Result};
use crate::policy::Policy;
use crate::slm::SnapshotPolicyRecord;
use crate::state::LifecycleState;

use super::{next_version, Expect, LifecycleStore};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

const STATES: Table = TableDefinition::new("lifecycle_states");
const POLICIES: Table = TableDefinition::new("policies");
const SNAPSHOT_POLICIES: Table = TableDefinition::new("snapshot_policies");
const META: Table = TableDefinition::new("meta");

const ALL_TABLES: [Table; 4] = [STATES, POLICIES, SNAPSHOT_POLICIES, META];

fn db_err(e: impl Display) -> LifecycleError {
    LifecycleError::Store(e.to_string())
}

fn record_version(value: &serde_json::Value) -> u64 {
    value.get("version").and_then(|v| v.as_u64()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database at `path`, creating every table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        for table in ALL_TABLES {
            wt.open_table(table).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    fn read<T: DeserializeOwned>(&self, table: Table, key: &str) -> Result<Option<T>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(table).map_err(db_err)?;
        let record = match table.get(key).map_err(db_err)? {
            Some(guard) => Some(serde_json::from_slice(guard.value())?),
            None => None,
        };
        Ok(record)
    }

    fn list<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(table).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    fn remove(&self, table: Table, key: &str) -> Result<bool> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let existed = {
            let mut table = wt.open_table(table).map_err(db_err)?;
            let removed = table.remove(key).map_err(db_err)?;
            removed.is_some()
        };
        wt.commit().map_err(db_err)?;
        Ok(existed)
    }

    /// Check `expect` against the stored version and write `record` with the
    /// next version, all in one transaction.
    fn write_versioned<T: Serialize + DeserializeOwned>(
        &self,
        table: Table,
        key: &str,
        record: &T,
        expect: Expect,
    ) -> Result<T> {
        let mut value = serde_json::to_value(record)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut t = wt.open_table(table).map_err(db_err)?;
            let found = t
                .get(key)
                .map_err(db_err)?
                .map(|guard| serde_json::from_slice::<serde_json::Value>(guard.value()))
                .transpose()?
                .map(|v| record_version(&v));
            let version = next_version(key, expect, found)?;
            if let Some(obj) = value.as_object_mut() {
                obj.insert("version".to_string(), version.into());
            }
            let bytes = serde_json::to_vec(&value)?;
            t.insert(key, bytes.as_slice()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(serde_json::from_value(value)?)
    }
}

impl LifecycleStore for RedbStore {
    fn get_state(&self, index: &str) -> Result<Option<LifecycleState>> {
        self.read(STATES, index)
    }

    fn list_states(&self) -> Result<Vec<LifecycleState>> {
        self.list(STATES)
    }

    fn put_state(&self, state: &LifecycleState, expect: Expect) -> Result<LifecycleState> {
        self.write_versioned(STATES, &state.index, state, expect)
    }

    fn delete_state(&self, index: &str) -> Result<bool> {
        self.remove(STATES, index)
    }

    fn get_policy(&self, name: &str) -> Result<Option<Policy>> {
        self.read(POLICIES, name)
    }

    fn list_policies(&self) -> Result<Vec<Policy>> {
        self.list(POLICIES)
    }

    fn put_policy(&self, policy: &Policy) -> Result<Policy> {
        let mut policy = policy.clone();
        policy.modified_date = Utc::now();
        self.write_versioned(POLICIES, &policy.name.clone(), &policy, Expect::Any)
    }

    fn delete_policy(&self, name: &str) -> Result<bool> {
        self.remove(POLICIES, name)
    }

    fn get_snapshot_policy(&self, id: &str) -> Result<Option<SnapshotPolicyRecord>> {
        self.read(SNAPSHOT_POLICIES, id)
    }

    fn list_snapshot_policies(&self) -> Result<Vec<SnapshotPolicyRecord>> {
        self.list(SNAPSHOT_POLICIES)
    }

    fn put_snapshot_policy(
        &self,
        record: &SnapshotPolicyRecord,
        expect: Expect,
    ) -> Result<SnapshotPolicyRecord> {
        self.write_versioned(SNAPSHOT_POLICIES, &record.policy.id, record, expect)
    }

    fn delete_snapshot_policy(&self, id: &str) -> Result<bool> {
        self.remove(SNAPSHOT_POLICIES, id)
    }

    fn get_meta(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.read(META, key)
    }

    fn put_meta(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(META).map_err(db_err)?;
            table.insert(key, bytes.as_slice()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::Identity;
    use crate::policy::LifecycleAction;
    use crate::slm::SnapshotPolicy;
    use crate::store::{MetaExt, Subsystem};
    use crate::types::{ExecutionStatus, OperationMode, TimeValue};
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, RedbStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("state.redb")).unwrap();
        (dir, store)
    }

    fn state(index: &str) -> LifecycleState {
        LifecycleState::new(index, "logs", Identity::new("ilm"), Utc::now())
    }

    #[test]
    fn put_state_bumps_version_and_rejects_stale_writes() {
        let (_dir, store) = open_tmp();
        let stored = store.put_state(&state("a"), Expect::Absent).unwrap();
        assert_eq!(stored.version, 1);

        let mut next = stored.clone();
        next.status = ExecutionStatus::Executing;
        let stored2 = store.put_state(&next, Expect::Version(1)).unwrap();
        assert_eq!(stored2.version, 2);

        // A writer still holding version 1 loses.
        let err = store.put_state(&stored, Expect::Version(1)).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::VersionConflict {
                expected: 1,
                found: 2,
                ..
            }
        ));
        assert_eq!(
            store.get_state("a").unwrap().unwrap().status,
            ExecutionStatus::Executing
        );
        assert!(store.put_state(&state("a"), Expect::Absent).is_err());
    }

    #[test]
    fn states_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.put_state(&state("a"), Expect::Absent).unwrap();
            store.put_state(&state("b"), Expect::Absent).unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        let names: Vec<String> = store
            .list_states()
            .unwrap()
            .into_iter()
            .map(|s| s.index)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(store.delete_state("a").unwrap());
        assert!(!store.delete_state("a").unwrap());
    }

    #[test]
    fn put_policy_increments_version() {
        let (_dir, store) = open_tmp();
        let policy = Policy::singleton("p", "hot", TimeValue::ZERO, LifecycleAction::ReadOnly);
        assert_eq!(store.put_policy(&policy).unwrap().version, 1);
        assert_eq!(store.put_policy(&policy).unwrap().version, 2);
        assert_eq!(store.get_policy("p").unwrap().unwrap().version, 2);
        assert!(store.get_policy("missing").unwrap().is_none());
    }

    #[test]
    fn snapshot_policy_records_are_conditional() {
        let (_dir, store) = open_tmp();
        let record = SnapshotPolicyRecord::new(SnapshotPolicy::new(
            "nightly",
            "snap",
            "0 30 1 * * ?",
            "repo",
        ));
        let stored = store
            .put_snapshot_policy(&record, Expect::Absent)
            .unwrap();
        assert_eq!(stored.version, 1);
        assert!(store
            .put_snapshot_policy(&record, Expect::Version(0))
            .is_err());
        assert_eq!(store.list_snapshot_policies().unwrap().len(), 1);
    }

    #[test]
    fn meta_roundtrip() {
        let (_dir, store) = open_tmp();
        store
            .set_operation_mode(Subsystem::Ilm, OperationMode::Stopping)
            .unwrap();
        store.set_retention_requested(true).unwrap();
        assert_eq!(
            store.operation_mode(Subsystem::Ilm).unwrap(),
            OperationMode::Stopping
        );
        assert!(store.retention_requested().unwrap());
    }
}
