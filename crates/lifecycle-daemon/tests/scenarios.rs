use std::sync::Arc;

use chrono::{DateTime, Utc};
use lifecycle_core::config::Config;
use lifecycle_core::engine::{IndexEngine, IndexSettings, MemoryEngine};
use lifecycle_core::oracle::{Identity, RoleDescriptor, RoleOracle};
use lifecycle_core::policy::{LifecycleAction, Phase, Policy, RolloverConditions};
use lifecycle_core::repository::{MemoryRepository, SnapshotRepository, SnapshotState};
use lifecycle_core::slm::{RetentionConfig, SnapshotPolicy};
use lifecycle_core::step::ErrorKind;
use lifecycle_core::store::{LifecycleStore, RedbStore};
use lifecycle_core::types::{ExecutionStatus, StepKey, TimeValue};
use lifecycle_core::LifecycleError;
use lifecycle_daemon::{Advancement, DaemonError, LifecycleService};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const TICKS: usize = 10;

struct Cluster {
    _dir: TempDir,
    store: Arc<RedbStore>,
    oracle: Arc<RoleOracle>,
    engine: Arc<MemoryEngine>,
    repository: Arc<MemoryRepository>,
    service: LifecycleService,
}

fn cluster() -> Cluster {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(RedbStore::open(&dir.path().join("state.redb")).unwrap());
    let oracle = Arc::new(RoleOracle::new());
    oracle.put_role(
        "superuser",
        RoleDescriptor::cluster(&["all"]).with_index(&["*"], &["all"]),
    );
    oracle.put_user("admin", &["superuser"]);
    let engine = Arc::new(MemoryEngine::new());
    let repository = Arc::new(MemoryRepository::new());
    let service = LifecycleService::new(
        store.clone(),
        oracle.clone(),
        engine.clone(),
        repository.clone(),
        Config::default(),
    );
    Cluster {
        _dir: dir,
        store,
        oracle,
        engine,
        repository,
        service,
    }
}

fn admin() -> Identity {
    Identity::new("admin")
}

fn delete_policy() -> Policy {
    Policy::singleton(
        "deletePolicy",
        "delete",
        TimeValue::ZERO,
        LifecycleAction::Delete {
            delete_searchable_snapshot: true,
        },
    )
}

/// Tick until `done` holds or the budget runs out; returns the ticks used.
async fn tick_until(c: &Cluster, now: DateTime<Utc>, done: impl Fn(&Cluster) -> bool) -> Option<usize> {
    for n in 1..=TICKS {
        c.service.orchestrator().tick(now).await.unwrap();
        if done(c) {
            return Some(n);
        }
    }
    None
}

/// Snapshot names in `repository`, oldest first.
fn snapshot_names(c: &Cluster, repository: &str) -> Vec<String> {
    c.repository
        .list_snapshots(repository)
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect()
}

/// Put `policy` as the limited identity `test_ilm` with the given index
/// privileges on `ilm-*`.
async fn put_policy_as_test_ilm(c: &Cluster, policy: Policy, index_privileges: &[&str]) {
    c.oracle.put_role(
        "test_ilm",
        RoleDescriptor::cluster(&["manage_ilm"]).with_index(&["ilm-*"], index_privileges),
    );
    c.oracle.put_user("test_ilm", &["test_ilm"]);
    c.service
        .admin()
        .put_policy(&Identity::new("test_ilm"), policy)
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Index lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_delete_with_full_permissions() {
    let c = cluster();
    put_policy_as_test_ilm(&c, delete_policy(), &["manage"]).await;
    c.engine
        .create_index("ilm-00001", &IndexSettings::with_policy("deletePolicy"))
        .unwrap();

    let used = tick_until(&c, Utc::now(), |c| !c.engine.index_exists("ilm-00001").unwrap()).await;
    assert!(used.is_some(), "index was never deleted");
    assert!(c.store.get_state("ilm-00001").unwrap().is_none());
}

#[tokio::test]
async fn scenario_b_missing_monitor_then_granted() {
    let c = cluster();
    put_policy_as_test_ilm(&c, delete_policy(), &["delete_index"]).await;
    c.engine
        .create_index("ilm-00001", &IndexSettings::with_policy("deletePolicy"))
        .unwrap();
    let now = Utc::now();

    // Enter the phase, then fail the monitor-gated step on every tick.
    for expected_failures in 0..4u32 {
        c.service.orchestrator().tick(now).await.unwrap();
        let state = c.store.get_state("ilm-00001").unwrap().unwrap();
        assert_eq!(state.step.phase, "delete");
        assert_eq!(state.retry_count, expected_failures);
    }

    let explain = c.service.admin().explain(&admin(), "ilm-00001").await.unwrap();
    assert!(explain.managed);
    assert!(explain.failed_step_retry_count.unwrap() >= 1);
    let info = explain.step_info.unwrap();
    assert_eq!(info["kind"], "permission_denied");
    let reason = info["reason"].as_str().unwrap();
    assert!(
        reason.contains("action [indices:monitor/stats] is unauthorized for user [test_ilm]"),
        "{reason}"
    );
    assert!(c.engine.index_exists("ilm-00001").unwrap());

    // Granting takes effect on the next tick without an operator retry.
    c.oracle.put_role(
        "test_ilm",
        RoleDescriptor::cluster(&["manage_ilm"]).with_index(&["ilm-*"], &["monitor", "manage"]),
    );
    let report = c.service.orchestrator().tick(now).await.unwrap();
    assert!(matches!(
        report.advancement("ilm-00001"),
        Some(Advancement::Stepped { .. })
    ));
    let used = tick_until(&c, now, |c| !c.engine.index_exists("ilm-00001").unwrap()).await;
    assert_eq!(used, Some(1));
}

#[tokio::test]
async fn scenario_c_rollover_on_max_docs() {
    let c = cluster();
    let policy = Policy::singleton(
        "rollover",
        "hot",
        TimeValue::ZERO,
        LifecycleAction::Rollover(RolloverConditions {
            max_docs: Some(2),
            ..Default::default()
        }),
    );
    put_policy_as_test_ilm(&c, policy, &["manage"]).await;
    c.engine
        .create_index_with_alias(
            "ilm-000001",
            &IndexSettings::with_policy("rollover").rollover_alias("ilm"),
            "ilm",
            true,
        )
        .unwrap();
    let now = Utc::now();

    // Below the threshold the check step keeps waiting.
    c.engine
        .index_document("ilm", serde_json::json!({"n": 1}))
        .unwrap();
    c.service.orchestrator().tick(now).await.unwrap();
    let report = c.service.orchestrator().tick(now).await.unwrap();
    assert_eq!(report.advancement("ilm-000001"), Some(&Advancement::Waiting));

    c.engine
        .index_document("ilm", serde_json::json!({"n": 2}))
        .unwrap();
    let used = tick_until(&c, now, |c| {
        c.engine
            .alias_targets("ilm")
            .unwrap()
            .iter()
            .any(|t| t.index == "ilm-000002" && t.is_write_index)
    })
    .await;
    assert!(used.is_some(), "write alias never moved");

    let targets = c.engine.alias_targets("ilm").unwrap();
    let old = targets.iter().find(|t| t.index == "ilm-000001").unwrap();
    assert!(!old.is_write_index);
    let landed = c
        .engine
        .index_document("ilm", serde_json::json!({"n": 3}))
        .unwrap();
    assert_eq!(landed, "ilm-000002");
    assert_eq!(c.engine.doc_count("ilm-000002").unwrap(), 1);

    // The new index is picked up by discovery and the old one finishes.
    tick_until(&c, now, |c| {
        c.store
            .get_state("ilm-000001")
            .unwrap()
            .is_some_and(|s| s.is_completed())
    })
    .await
    .expect("old index never completed");
    assert!(c.engine.index_settings("ilm-000001").unwrap().indexing_complete);
    assert!(c.store.get_state("ilm-000002").unwrap().is_some());
}

#[tokio::test]
async fn pointer_only_moves_forward_under_ticking() {
    let c = cluster();
    let policy = Policy::new(
        "three-phase",
        vec![
            Phase::new("hot", TimeValue::ZERO, vec![LifecycleAction::SetPriority { priority: 100 }]),
            Phase::new("warm", TimeValue::ZERO, vec![LifecycleAction::ReadOnly]),
            Phase::new(
                "delete",
                TimeValue::ZERO,
                vec![LifecycleAction::Delete {
                    delete_searchable_snapshot: true,
                }],
            ),
        ],
    );
    put_policy_as_test_ilm(&c, policy, &["manage"]).await;
    c.engine
        .create_index("ilm-1", &IndexSettings::with_policy("three-phase"))
        .unwrap();

    let order = ["new", "hot", "warm", "delete"];
    let mut last = 0;
    for _ in 0..TICKS {
        c.service.orchestrator().tick(Utc::now()).await.unwrap();
        let Some(state) = c.store.get_state("ilm-1").unwrap() else {
            break;
        };
        let pos = order.iter().position(|p| *p == state.step.phase).unwrap();
        assert!(pos >= last, "pointer moved back to {}", state.step);
        last = pos;
    }
    assert!(!c.engine.index_exists("ilm-1").unwrap());
}

#[tokio::test]
async fn move_to_unknown_step_is_rejected() {
    let c = cluster();
    put_policy_as_test_ilm(&c, delete_policy(), &["manage"]).await;
    c.engine
        .create_index("ilm-00001", &IndexSettings::default())
        .unwrap();
    c.service
        .admin()
        .bind(&admin(), "ilm-00001", "deletePolicy")
        .await
        .unwrap();
    let before = c.store.get_state("ilm-00001").unwrap().unwrap();

    let err = c
        .service
        .admin()
        .move_to_step(
            &admin(),
            "ilm-00001",
            None,
            StepKey::new("hot", "rollover", "attempt-rollover"),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DaemonError::Lifecycle(LifecycleError::InvalidMove { .. })
    ));
    assert_eq!(c.store.get_state("ilm-00001").unwrap().unwrap(), before);
}

#[tokio::test]
async fn non_retryable_failure_waits_for_operator_retry() {
    let c = cluster();
    // A rollover index without a rollover alias cannot make progress.
    let policy = Policy::singleton(
        "rollover",
        "hot",
        TimeValue::ZERO,
        LifecycleAction::Rollover(RolloverConditions {
            max_docs: Some(1),
            ..Default::default()
        }),
    );
    put_policy_as_test_ilm(&c, policy, &["manage"]).await;
    c.engine
        .create_index("ilm-000001", &IndexSettings::with_policy("rollover"))
        .unwrap();
    let now = Utc::now();
    c.service.orchestrator().tick(now).await.unwrap();
    let report = c.service.orchestrator().tick(now).await.unwrap();
    assert_eq!(
        report.advancement("ilm-000001"),
        Some(&Advancement::Failed {
            kind: ErrorKind::NonRetryableExecutionError
        })
    );

    // Not retried automatically.
    let report = c.service.orchestrator().tick(now).await.unwrap();
    assert_eq!(report.advancement("ilm-000001"), Some(&Advancement::Idle));
    let state = c.store.get_state("ilm-000001").unwrap().unwrap();
    assert_eq!(state.status, ExecutionStatus::Error);
    assert_eq!(state.retry_count, 1);

    let retried = c.service.admin().retry(&admin(), "ilm-000001").await.unwrap();
    assert_eq!(retried.status, ExecutionStatus::Pending);
    let report = c.service.orchestrator().tick(now).await.unwrap();
    assert!(matches!(
        report.advancement("ilm-000001"),
        Some(Advancement::Failed { .. })
    ));
    assert_eq!(
        c.store.get_state("ilm-000001").unwrap().unwrap().retry_count,
        2
    );
}

#[tokio::test]
async fn unavailable_engine_is_retried_automatically() {
    let c = cluster();
    put_policy_as_test_ilm(&c, delete_policy(), &["manage"]).await;
    c.engine
        .create_index("ilm-00001", &IndexSettings::with_policy("deletePolicy"))
        .unwrap();
    let now = Utc::now();
    c.service.orchestrator().tick(now).await.unwrap();

    c.engine.set_unavailable(true);
    let report = c.service.orchestrator().tick(now).await.unwrap();
    assert_eq!(
        report.advancement("ilm-00001"),
        Some(&Advancement::Failed {
            kind: ErrorKind::ResourceUnavailable
        })
    );

    c.engine.set_unavailable(false);
    let used = tick_until(&c, now, |c| !c.engine.index_exists("ilm-00001").unwrap()).await;
    assert!(used.is_some());
}

#[tokio::test]
async fn state_survives_restart_from_the_store() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.redb");
    let engine = Arc::new(MemoryEngine::new());
    let oracle = Arc::new(RoleOracle::new());
    oracle.put_role(
        "superuser",
        RoleDescriptor::cluster(&["all"]).with_index(&["*"], &["all"]),
    );
    oracle.put_user("admin", &["superuser"]);
    engine
        .create_index("ilm-00001", &IndexSettings::with_policy("deletePolicy"))
        .unwrap();

    let step_after_first_run = {
        let store = Arc::new(RedbStore::open(&path).unwrap());
        let service = LifecycleService::new(
            store.clone(),
            oracle.clone(),
            engine.clone(),
            Arc::new(MemoryRepository::new()),
            Config::default(),
        );
        service.admin().put_policy(&admin(), delete_policy()).await.unwrap();
        service.orchestrator().tick(Utc::now()).await.unwrap();
        store.get_state("ilm-00001").unwrap().unwrap().step
    };
    assert_eq!(step_after_first_run.phase, "delete");

    let store = Arc::new(RedbStore::open(&path).unwrap());
    let service = LifecycleService::new(
        store.clone(),
        oracle,
        engine.clone(),
        Arc::new(MemoryRepository::new()),
        Config::default(),
    );
    service.orchestrator().recover().await.unwrap();
    assert_eq!(
        store.get_state("ilm-00001").unwrap().unwrap().step,
        step_after_first_run
    );
    for _ in 0..TICKS {
        service.orchestrator().tick(Utc::now()).await.unwrap();
    }
    assert!(!engine.index_exists("ilm-00001").unwrap());
}

// ---------------------------------------------------------------------------
// Snapshot lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_d_manual_snapshot_then_retention() {
    let c = cluster();
    c.repository.add_repository("my_snap");
    c.engine
        .create_index("ilm-00001", &IndexSettings::default())
        .unwrap();
    let mut policy = SnapshotPolicy::new("test_slm", "snap", "1 2 3 4 5 ?", "my_snap");
    policy.retention = Some(RetentionConfig {
        expire_after: Some(TimeValue::ZERO),
        ..Default::default()
    });
    let slm = c.service.snapshots();
    slm.put_policy(&admin(), policy).await.unwrap();

    let name = slm.execute_policy(&admin(), "test_slm").await.unwrap();
    let status = slm.snapshot_status(&admin(), "my_snap", &name).await.unwrap();
    assert_eq!(status.state, SnapshotState::Success);
    assert_eq!(status.state.as_str(), "SUCCESS");

    let report = slm.execute_retention(&admin()).await.unwrap();
    assert_eq!(report.deleted, vec![name.clone()]);

    let err = slm
        .snapshot_status(&admin(), "my_snap", &name)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DaemonError::Engine(lifecycle_core::engine::EngineError::NotFound(_))
    ));

    let stats = lifecycle_core::admin::slm_stats(c.store.as_ref()).unwrap();
    assert_eq!(stats.totals.snapshots_taken, 1);
    assert_eq!(stats.totals.snapshots_deleted, 1);
    assert_eq!(stats.retention.retention_runs, 1);
}

#[tokio::test]
async fn retention_twice_keeps_the_same_set() {
    let c = cluster();
    c.repository.add_repository("my_snap");
    let mut policy = SnapshotPolicy::new("test_slm", "snap", "1 2 3 4 5 ?", "my_snap");
    policy.retention = Some(RetentionConfig {
        expire_after: None,
        min_count: None,
        max_count: Some(2),
    });
    let slm = c.service.snapshots();
    slm.put_policy(&admin(), policy).await.unwrap();
    let mut names = Vec::new();
    for _ in 0..4 {
        names.push(slm.execute_policy(&admin(), "test_slm").await.unwrap());
        // distinct start times
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    slm.execute_retention(&admin()).await.unwrap();
    let after_first = snapshot_names(&c, "my_snap");
    let report = slm.execute_retention(&admin()).await.unwrap();
    assert!(report.deleted.is_empty());
    let after_second = snapshot_names(&c, "my_snap");
    assert_eq!(after_first, after_second);
    assert_eq!(after_first, names[2..].to_vec());
}
