use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Utc;

use crate::error::Result;
use crate::policy::Policy;
use crate::slm::SnapshotPolicyRecord;
use crate::state::LifecycleState;

use super::{next_version, Expect, LifecycleStore};

#[derive(Default)]
struct Tables {
    states: BTreeMap<String, LifecycleState>,
    policies: BTreeMap<String, Policy>,
    snapshot_policies: BTreeMap<String, SnapshotPolicyRecord>,
    meta: BTreeMap<String, serde_json::Value>,
}

/// Volatile store with the same conditional-write rules as `RedbStore`.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LifecycleStore for MemoryStore {
    fn get_state(&self, index: &str) -> Result<Option<LifecycleState>> {
        Ok(self.lock().states.get(index).cloned())
    }

    fn list_states(&self) -> Result<Vec<LifecycleState>> {
        Ok(self.lock().states.values().cloned().collect())
    }

    fn put_state(&self, state: &LifecycleState, expect: Expect) -> Result<LifecycleState> {
        let mut tables = self.lock();
        let found = tables.states.get(&state.index).map(|s| s.version);
        let mut stored = state.clone();
        stored.version = next_version(&state.index, expect, found)?;
        tables.states.insert(stored.index.clone(), stored.clone());
        Ok(stored)
    }

    fn delete_state(&self, index: &str) -> Result<bool> {
        Ok(self.lock().states.remove(index).is_some())
    }

    fn get_policy(&self, name: &str) -> Result<Option<Policy>> {
        Ok(self.lock().policies.get(name).cloned())
    }

    fn list_policies(&self) -> Result<Vec<Policy>> {
        Ok(self.lock().policies.values().cloned().collect())
    }

    fn put_policy(&self, policy: &Policy) -> Result<Policy> {
        let mut tables = self.lock();
        let found = tables.policies.get(&policy.name).map(|p| p.version);
        let mut stored = policy.clone();
        stored.version = next_version(&policy.name, Expect::Any, found)?;
        stored.modified_date = Utc::now();
        tables.policies.insert(stored.name.clone(), stored.clone());
        Ok(stored)
    }

    fn delete_policy(&self, name: &str) -> Result<bool> {
        Ok(self.lock().policies.remove(name).is_some())
    }

    fn get_snapshot_policy(&self, id: &str) -> Result<Option<SnapshotPolicyRecord>> {
        Ok(self.lock().snapshot_policies.get(id).cloned())
    }

    fn list_snapshot_policies(&self) -> Result<Vec<SnapshotPolicyRecord>> {
        Ok(self.lock().snapshot_policies.values().cloned().collect())
    }

    fn put_snapshot_policy(
        &self,
        record: &SnapshotPolicyRecord,
        expect: Expect,
    ) -> Result<SnapshotPolicyRecord> {
        let mut tables = self.lock();
        let id = record.policy.id.clone();
        let found = tables.snapshot_policies.get(&id).map(|r| r.version);
        let mut stored = record.clone();
        stored.version = next_version(&id, expect, found)?;
        tables.snapshot_policies.insert(id, stored.clone());
        Ok(stored)
    }

    fn delete_snapshot_policy(&self, id: &str) -> Result<bool> {
        Ok(self.lock().snapshot_policies.remove(id).is_some())
    }

    fn get_meta(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.lock().meta.get(key).cloned())
    }

    fn put_meta(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.lock().meta.insert(key.to_string(), value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LifecycleError;
    use crate::oracle::Identity;

    #[test]
    fn conditional_writes_match_redb_rules() {
        let store = MemoryStore::new();
        let state = LifecycleState::new("a", "p", Identity::new("u"), Utc::now());
        let v1 = store.put_state(&state, Expect::Absent).unwrap();
        assert_eq!(v1.version, 1);
        assert!(matches!(
            store.put_state(&state, Expect::Version(0)),
            Err(LifecycleError::VersionConflict { .. })
        ));
        let forced = store.put_state(&state, Expect::Any).unwrap();
        assert_eq!(forced.version, 2);
    }
}
