//! One scheduler for both loops: a fixed interval plus an explicit wake.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use lifecycle_core::config::Config;
use lifecycle_core::engine::IndexEngine;
use lifecycle_core::executor::StepExecutor;
use lifecycle_core::oracle::PermissionOracle;
use lifecycle_core::repository::SnapshotRepository;
use lifecycle_core::store::LifecycleStore;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::admin::AdminApi;
use crate::error::DaemonResult;
use crate::orchestrator::Orchestrator;
use crate::slm::SnapshotManager;

pub struct LifecycleService {
    orchestrator: Orchestrator,
    snapshots: SnapshotManager,
    admin: AdminApi,
    wake: Arc<Notify>,
    config: Arc<Config>,
}

impl LifecycleService {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        oracle: Arc<dyn PermissionOracle>,
        engine: Arc<dyn IndexEngine>,
        repository: Arc<dyn SnapshotRepository>,
        config: Config,
    ) -> Self {
        let config = Arc::new(config);
        let wake = Arc::new(Notify::new());
        let executor = StepExecutor::new(oracle.clone(), engine.clone(), repository);
        Self {
            orchestrator: Orchestrator::new(store.clone(), executor.clone(), config.clone()),
            snapshots: SnapshotManager::new(store.clone(), executor, config.clone()),
            admin: AdminApi::new(store, oracle, engine, wake.clone()),
            wake,
            config,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn admin(&self) -> &AdminApi {
        &self.admin
    }

    /// Trigger a tick without waiting for the interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Drive both loops until `shutdown` resolves. Ticks run as spawned tasks
    /// so a slow tick never delays the schedule; per-resource locks keep
    /// overlapping ticks apart. In-flight ticks are awaited before returning.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> DaemonResult<()> {
        self.orchestrator.recover().await?;

        let mut interval = tokio::time::interval(self.config.poll_interval.to_std());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(poll_interval = %self.config.poll_interval, workers = self.config.workers, "lifecycle service started");
        let mut ticks = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
                _ = self.wake.notified() => debug!("woken"),
            }
            while ticks.try_join_next().is_some() {}
            ticks.spawn(run_tick(self.orchestrator.clone(), self.snapshots.clone()));
        }

        while ticks.join_next().await.is_some() {}
        info!("lifecycle service stopped");
        Ok(())
    }
}

async fn run_tick(orchestrator: Orchestrator, snapshots: SnapshotManager) {
    let now = Utc::now();
    let (ilm, slm) = tokio::join!(orchestrator.tick(now), snapshots.tick(now));
    match ilm {
        Ok(report) => debug!(
            mode = %report.mode,
            discovered = report.discovered,
            resources = report.resources.len(),
            "ilm tick"
        ),
        Err(e) => warn!("ilm tick failed: {e}"),
    }
    match slm {
        Ok(report) => debug!(
            mode = %report.mode,
            created = report.created.len(),
            failed = report.failed,
            "slm tick"
        ),
        Err(e) => warn!("slm tick failed: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
