//! Identity-guarded administrative operations.
//!
//! Each call is authorized against the permission oracle for the caller,
//! then delegates to the store-level operations in `lifecycle_core::admin`.
//! Writes that change what the loop should do next wake the scheduler.

use std::sync::Arc;

use chrono::Utc;
use lifecycle_core::admin;
use lifecycle_core::engine::IndexEngine;
use lifecycle_core::oracle::{Identity, PermissionOracle, Resource};
use lifecycle_core::policy::Policy;
use lifecycle_core::state::{Explain, LifecycleState};
use lifecycle_core::store::{LifecycleStore, MetaExt, Subsystem};
use lifecycle_core::types::{OperationMode, StepKey};
use lifecycle_core::LifecycleError;
use tokio::sync::Notify;

use crate::error::DaemonResult;
use crate::util::{blocking, require};

pub const ACTION_EXPLAIN: &str = "indices:admin/ilm/explain";
pub const ACTION_RETRY: &str = "indices:admin/ilm/retry";
pub const ACTION_MOVE: &str = "indices:admin/ilm/move";
pub const ACTION_UPDATE_SETTINGS: &str = "indices:admin/settings/update";
pub const ACTION_PUT_POLICY: &str = "cluster:admin/ilm/put";
pub const ACTION_GET_POLICY: &str = "cluster:admin/ilm/get";
pub const ACTION_DELETE_POLICY: &str = "cluster:admin/ilm/delete";

fn mode_action(subsystem: Subsystem, mode: OperationMode) -> &'static str {
    match (subsystem, mode) {
        (Subsystem::Ilm, OperationMode::Running) => "cluster:admin/ilm/start",
        (Subsystem::Ilm, _) => "cluster:admin/ilm/stop",
        (Subsystem::Slm, OperationMode::Running) => "cluster:admin/slm/start",
        (Subsystem::Slm, _) => "cluster:admin/slm/stop",
    }
}

fn mode_read_action(subsystem: Subsystem) -> &'static str {
    match subsystem {
        Subsystem::Ilm => "cluster:admin/ilm/operation_mode/get",
        Subsystem::Slm => "cluster:admin/slm/status",
    }
}

#[derive(Clone)]
pub struct AdminApi {
    store: Arc<dyn LifecycleStore>,
    oracle: Arc<dyn PermissionOracle>,
    engine: Arc<dyn IndexEngine>,
    wake: Arc<Notify>,
}

impl AdminApi {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        oracle: Arc<dyn PermissionOracle>,
        engine: Arc<dyn IndexEngine>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            oracle,
            engine,
            wake,
        }
    }

    fn require(&self, caller: &Identity, action: &str, resource: &Resource) -> DaemonResult<()> {
        require(self.oracle.as_ref(), caller, action, resource)
    }

    /// Explain one index. Unknown indices are an error; existing but
    /// unmanaged ones report `managed: false`.
    pub async fn explain(&self, caller: &Identity, index: &str) -> DaemonResult<Explain> {
        self.require(caller, ACTION_EXPLAIN, &Resource::index(index))?;
        let store = self.store.clone();
        let engine = self.engine.clone();
        let index = index.to_string();
        blocking(move || {
            let explain = admin::explain(store.as_ref(), &index)?;
            if !explain.managed && !engine.index_exists(&index)? {
                return Err(LifecycleError::IndexNotFound(index).into());
            }
            Ok(explain)
        })
        .await
    }

    pub async fn retry(&self, caller: &Identity, index: &str) -> DaemonResult<LifecycleState> {
        self.require(caller, ACTION_RETRY, &Resource::index(index))?;
        let store = self.store.clone();
        let index = index.to_string();
        let state = blocking(move || Ok(admin::retry(store.as_ref(), &index)?)).await?;
        self.wake.notify_one();
        Ok(state)
    }

    pub async fn move_to_step(
        &self,
        caller: &Identity,
        index: &str,
        expected: Option<StepKey>,
        target: StepKey,
    ) -> DaemonResult<LifecycleState> {
        self.require(caller, ACTION_MOVE, &Resource::index(index))?;
        let store = self.store.clone();
        let index = index.to_string();
        let state = blocking(move || {
            Ok(admin::move_to_step(
                store.as_ref(),
                &index,
                expected.as_ref(),
                target,
            )?)
        })
        .await?;
        self.wake.notify_one();
        Ok(state)
    }

    /// Store `policy`; the caller becomes its execution identity.
    pub async fn put_policy(&self, caller: &Identity, policy: Policy) -> DaemonResult<Policy> {
        self.require(caller, ACTION_PUT_POLICY, &Resource::Cluster)?;
        let store = self.store.clone();
        let caller = caller.clone();
        let stored = blocking(move || Ok(admin::set_policy(store.as_ref(), &policy, &caller)?)).await?;
        self.wake.notify_one();
        Ok(stored)
    }

    pub async fn get_policy(&self, caller: &Identity, name: &str) -> DaemonResult<Policy> {
        self.require(caller, ACTION_GET_POLICY, &Resource::Cluster)?;
        let store = self.store.clone();
        let name = name.to_string();
        blocking(move || Ok(admin::get_policy(store.as_ref(), &name)?)).await
    }

    pub async fn delete_policy(&self, caller: &Identity, name: &str) -> DaemonResult<()> {
        self.require(caller, ACTION_DELETE_POLICY, &Resource::Cluster)?;
        let store = self.store.clone();
        let name = name.to_string();
        blocking(move || Ok(admin::delete_policy(store.as_ref(), &name)?)).await
    }

    /// Start managing an existing index under `policy`, acting as the
    /// policy's execution identity.
    pub async fn bind(&self, caller: &Identity, index: &str, policy: &str) -> DaemonResult<LifecycleState> {
        self.require(caller, ACTION_UPDATE_SETTINGS, &Resource::index(index))?;
        let store = self.store.clone();
        let engine = self.engine.clone();
        let index = index.to_string();
        let policy = policy.to_string();
        let state = blocking(move || {
            if !engine.index_exists(&index)? {
                return Err(LifecycleError::IndexNotFound(index).into());
            }
            Ok(admin::bind(store.as_ref(), &index, &policy, None, Utc::now())?)
        })
        .await?;
        self.wake.notify_one();
        Ok(state)
    }

    pub async fn unbind(&self, caller: &Identity, index: &str) -> DaemonResult<()> {
        self.require(caller, ACTION_UPDATE_SETTINGS, &Resource::index(index))?;
        let store = self.store.clone();
        let index = index.to_string();
        blocking(move || Ok(admin::unbind(store.as_ref(), &index)?)).await
    }

    pub async fn operation_mode(&self, caller: &Identity, subsystem: Subsystem) -> DaemonResult<OperationMode> {
        self.require(caller, mode_read_action(subsystem), &Resource::Cluster)?;
        let store = self.store.clone();
        blocking(move || Ok(store.operation_mode(subsystem)?)).await
    }

    /// Start or stop a loop; returns the resulting mode (`stopping` until the
    /// loop settles).
    pub async fn set_operation_mode(
        &self,
        caller: &Identity,
        subsystem: Subsystem,
        mode: OperationMode,
    ) -> DaemonResult<OperationMode> {
        self.require(caller, mode_action(subsystem, mode), &Resource::Cluster)?;
        let store = self.store.clone();
        let mode =
            blocking(move || Ok(admin::set_operation_mode(store.as_ref(), subsystem, mode)?)).await?;
        self.wake.notify_one();
        Ok(mode)
    }

    /// Ask the SLM loop to run a retention pass on its next tick.
    pub async fn request_retention(&self, caller: &Identity) -> DaemonResult<()> {
        self.require(caller, crate::slm::ACTION_EXECUTE_RETENTION, &Resource::Cluster)?;
        let store = self.store.clone();
        blocking(move || Ok(admin::request_retention(store.as_ref())?)).await?;
        self.wake.notify_one();
        Ok(())
    }

    /// Ask the SLM loop to run snapshot policy `id` on its next tick.
    pub async fn request_snapshot(&self, caller: &Identity, id: &str) -> DaemonResult<()> {
        self.require(caller, crate::slm::ACTION_EXECUTE, &Resource::Cluster)?;
        let store = self.store.clone();
        let id = id.to_string();
        blocking(move || {
            admin::request_snapshot(store.as_ref(), &id)?;
            Ok(())
        })
        .await?;
        self.wake.notify_one();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaemonError;
    use lifecycle_core::engine::{IndexSettings, MemoryEngine};
    use lifecycle_core::oracle::{RoleDescriptor, RoleOracle};
    use lifecycle_core::policy::LifecycleAction;
    use lifecycle_core::store::MemoryStore;
    use lifecycle_core::types::TimeValue;

    fn api() -> (AdminApi, Arc<MemoryEngine>) {
        let oracle = Arc::new(RoleOracle::new());
        oracle.put_role(
            "ilm_admin",
            RoleDescriptor::cluster(&["manage_ilm"]).with_index(&["*"], &["manage"]),
        );
        oracle.put_role("reader", RoleDescriptor::cluster(&["read_ilm"]).with_index(&["*"], &["view_index_metadata"]));
        oracle.put_user("admin", &["ilm_admin"]);
        oracle.put_user("reader", &["reader"]);
        let engine = Arc::new(MemoryEngine::new());
        let api = AdminApi::new(
            Arc::new(MemoryStore::new()),
            oracle,
            engine.clone(),
            Arc::new(Notify::new()),
        );
        (api, engine)
    }

    fn policy() -> Policy {
        Policy::singleton("hot-readonly", "hot", TimeValue::ZERO, LifecycleAction::ReadOnly)
    }

    #[tokio::test]
    async fn reader_can_explain_but_not_retry() {
        let (api, engine) = api();
        let admin = Identity::new("admin");
        let reader = Identity::new("reader");
        api.put_policy(&admin, policy()).await.unwrap();
        engine.create_index("logs-1", &IndexSettings::default()).unwrap();
        api.bind(&admin, "logs-1", "hot-readonly").await.unwrap();

        let explain = api.explain(&reader, "logs-1").await.unwrap();
        assert!(explain.managed);
        let err = api.retry(&reader, "logs-1").await.unwrap_err();
        assert!(matches!(err, DaemonError::Lifecycle(LifecycleError::Forbidden(ref m)) if m.contains("indices:admin/ilm/retry")));
        let err = api.put_policy(&reader, policy()).await.unwrap_err();
        assert!(matches!(err, DaemonError::Lifecycle(LifecycleError::Forbidden(_))));
    }

    #[tokio::test]
    async fn explain_unknown_index_is_not_found() {
        let (api, engine) = api();
        let admin = Identity::new("admin");
        let err = api.explain(&admin, "missing").await.unwrap_err();
        assert!(matches!(err, DaemonError::Lifecycle(LifecycleError::IndexNotFound(_))));

        engine.create_index("plain", &IndexSettings::default()).unwrap();
        assert!(!api.explain(&admin, "plain").await.unwrap().managed);
    }

    #[tokio::test]
    async fn put_policy_binds_caller_identity() {
        let (api, _) = api();
        let admin = Identity::new("admin");
        let stored = api.put_policy(&admin, policy()).await.unwrap();
        assert_eq!(stored.identity, Some(admin.clone()));
        assert_eq!(api.get_policy(&admin, "hot-readonly").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn stop_goes_through_stopping() {
        let (api, _) = api();
        let admin = Identity::new("admin");
        let mode = api
            .set_operation_mode(&admin, Subsystem::Ilm, OperationMode::Stopped)
            .await
            .unwrap();
        assert_eq!(mode, OperationMode::Stopping);
        assert_eq!(
            api.operation_mode(&admin, Subsystem::Ilm).await.unwrap(),
            OperationMode::Stopping
        );
    }
}
