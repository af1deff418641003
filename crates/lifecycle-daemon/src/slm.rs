//! Snapshot lifecycle management: scheduled and manual snapshot creation
//! plus retention passes, each run through the step executor under the
//! policy's execution identity.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use lifecycle_core::admin;
use lifecycle_core::config::Config;
use lifecycle_core::engine::EngineError;
use lifecycle_core::executor::{StepExecutor, Unfenced};
use lifecycle_core::oracle::{Identity, Resource};
use lifecycle_core::repository::SnapshotInfo;
use lifecycle_core::slm::schedule::{self, CronSchedule};
use lifecycle_core::slm::{
    retention, HistoryEntry, HistoryOperation, SnapshotPolicy, SnapshotPolicyRecord,
};
use lifecycle_core::step::{ErrorKind, StepError, StepKind, StepOutcome};
use lifecycle_core::store::{LifecycleStore, MetaExt, Subsystem};
use lifecycle_core::types::OperationMode;
use lifecycle_core::LifecycleError;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::util::{blocking, bounded_step, require};

pub const ACTION_PUT: &str = "cluster:admin/slm/put";
pub const ACTION_GET: &str = "cluster:admin/slm/get";
pub const ACTION_DELETE: &str = "cluster:admin/slm/delete";
pub const ACTION_EXECUTE: &str = "cluster:admin/slm/execute";
pub const ACTION_EXECUTE_RETENTION: &str = "cluster:admin/slm/execute_retention";
pub const ACTION_SNAPSHOT_GET: &str = "cluster:admin/snapshot/get";
const ACTION_MONITOR_INDEX: &str = "indices:monitor/stats";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionReport {
    pub deleted: Vec<String>,
    pub failed: usize,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlmTickReport {
    pub mode: OperationMode,
    /// Snapshot names created this tick, successful or not.
    pub created: Vec<String>,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionReport>,
}

#[derive(Clone)]
pub struct SnapshotManager {
    store: Arc<dyn LifecycleStore>,
    executor: StepExecutor,
    config: Arc<Config>,
    /// Held for the duration of a retention pass.
    retention: Arc<AsyncMutex<()>>,
}

impl SnapshotManager {
    pub fn new(store: Arc<dyn LifecycleStore>, executor: StepExecutor, config: Arc<Config>) -> Self {
        Self {
            store,
            executor,
            config,
            retention: Arc::default(),
        }
    }

    fn require(&self, caller: &Identity, action: &str, resource: &Resource) -> DaemonResult<()> {
        require(self.executor.oracle().as_ref(), caller, action, resource)
    }

    // -----------------------------------------------------------------------
    // Policy management
    // -----------------------------------------------------------------------

    /// Store `policy` with `caller` as its execution identity.
    pub async fn put_policy(
        &self,
        caller: &Identity,
        policy: SnapshotPolicy,
    ) -> DaemonResult<SnapshotPolicyRecord> {
        self.require(caller, ACTION_PUT, &Resource::Cluster)?;
        policy.validate()?;
        for index in &policy.config.indices {
            self.require(caller, ACTION_MONITOR_INDEX, &Resource::index(index.clone()))?;
        }
        let this = self.clone();
        let caller = caller.clone();
        blocking(move || {
            match this.executor.repository().list_snapshots(&policy.repository) {
                Ok(_) => {}
                Err(EngineError::NotFound(_)) => {
                    return Err(LifecycleError::InvalidPolicy {
                        policy: policy.id.clone(),
                        reason: format!("no such repository [{}]", policy.repository),
                    }
                    .into())
                }
                Err(e) => return Err(e.into()),
            }
            Ok(admin::set_snapshot_policy(this.store.as_ref(), &policy, &caller)?)
        })
        .await
    }

    pub async fn get_policy(&self, caller: &Identity, id: &str) -> DaemonResult<SnapshotPolicyRecord> {
        self.require(caller, ACTION_GET, &Resource::Cluster)?;
        let store = self.store.clone();
        let id = id.to_string();
        blocking(move || Ok(admin::get_snapshot_policy(store.as_ref(), &id)?)).await
    }

    pub async fn list_policies(&self, caller: &Identity) -> DaemonResult<Vec<SnapshotPolicyRecord>> {
        self.require(caller, ACTION_GET, &Resource::Cluster)?;
        let store = self.store.clone();
        blocking(move || Ok(store.list_snapshot_policies()?)).await
    }

    pub async fn delete_policy(&self, caller: &Identity, id: &str) -> DaemonResult<()> {
        self.require(caller, ACTION_DELETE, &Resource::Cluster)?;
        let store = self.store.clone();
        let id = id.to_string();
        blocking(move || Ok(admin::delete_snapshot_policy(store.as_ref(), &id)?)).await
    }

    // -----------------------------------------------------------------------
    // Manual triggers
    // -----------------------------------------------------------------------

    /// Take a snapshot for `id` right now and return its name.
    pub async fn execute_policy(&self, caller: &Identity, id: &str) -> DaemonResult<String> {
        self.require(caller, ACTION_EXECUTE, &Resource::Cluster)?;
        let store = self.store.clone();
        let id = id.to_string();
        let record = blocking(move || Ok(admin::get_snapshot_policy(store.as_ref(), &id)?)).await?;
        let (name, outcome) = self.take_snapshot(&record, Utc::now()).await?;
        match outcome {
            StepOutcome::Failed(err) => Err(DaemonError::Step(err)),
            _ => Ok(name),
        }
    }

    pub async fn execute_retention(&self, caller: &Identity) -> DaemonResult<RetentionReport> {
        self.require(caller, ACTION_EXECUTE_RETENTION, &Resource::Cluster)?;
        let Ok(_guard) = self.retention.clone().try_lock_owned() else {
            return Err(DaemonError::RetentionRunning);
        };
        self.run_retention(Utc::now()).await
    }

    pub async fn snapshot_status(
        &self,
        caller: &Identity,
        repository: &str,
        snapshot: &str,
    ) -> DaemonResult<SnapshotInfo> {
        self.require(caller, ACTION_SNAPSHOT_GET, &Resource::Cluster)?;
        let this = self.clone();
        let repository = repository.to_string();
        let snapshot = snapshot.to_string();
        blocking(move || {
            Ok(this
                .executor
                .repository()
                .snapshot_status(&repository, &snapshot)?)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    pub async fn tick(&self, now: DateTime<Utc>) -> DaemonResult<SlmTickReport> {
        let mut report = self.fire_due_policies(now).await?;
        if report.mode != OperationMode::Running {
            return Ok(report);
        }

        let this = self.clone();
        let retention_due = blocking(move || this.retention_due(now)).await?;
        if !retention_due {
            return Ok(report);
        }
        let Ok(_guard) = self.retention.clone().try_lock_owned() else {
            debug!("retention already running; skipping");
            return Ok(report);
        };
        match self.run_retention(now).await {
            Ok(retention) => report.retention = Some(retention),
            Err(e) => warn!("snapshot retention failed: {e}"),
        }
        Ok(report)
    }

    fn settle_mode(&self) -> DaemonResult<OperationMode> {
        let mode = self.store.operation_mode(Subsystem::Slm)?;
        if mode == OperationMode::Stopping {
            self.store
                .set_operation_mode(Subsystem::Slm, OperationMode::Stopped)?;
            info!("slm stopped");
            return Ok(OperationMode::Stopped);
        }
        Ok(mode)
    }

    async fn fire_due_policies(&self, now: DateTime<Utc>) -> DaemonResult<SlmTickReport> {
        let this = self.clone();
        let (mode, records) = blocking(move || {
            let mode = this.settle_mode()?;
            let records = if mode == OperationMode::Running {
                this.store.list_snapshot_policies()?
            } else {
                Vec::new()
            };
            Ok((mode, records))
        })
        .await?;

        let mut report = SlmTickReport {
            mode,
            ..Default::default()
        };
        for record in records {
            let this = self.clone();
            let Some(claimed) = blocking(move || Ok(this.claim_fire(record, now))).await? else {
                continue;
            };
            let (name, outcome) = self.take_snapshot(&claimed, now).await?;
            if !outcome.is_success() {
                report.failed += 1;
            }
            report.created.push(name);
        }
        Ok(report)
    }

    /// Mark `record` as fired at `now` when it is due or manually requested.
    /// `None` when it is not due or an overlapping tick claimed it first.
    fn claim_fire(
        &self,
        record: SnapshotPolicyRecord,
        now: DateTime<Utc>,
    ) -> Option<SnapshotPolicyRecord> {
        let id = record.policy.id.clone();
        let cron = match record.policy.cron() {
            Ok(cron) => cron,
            Err(e) => {
                warn!(policy = %id, "skipping snapshot policy: {e}");
                return None;
            }
        };
        let scheduled = schedule::is_due(&cron, Some(record.schedule_reference()), now);
        if !scheduled && !record.metadata.execute_requested {
            return None;
        }
        let mut won = false;
        let claimed = admin::update_snapshot_policy(self.store.as_ref(), &id, |r| {
            won = r.metadata.last_fired_at == record.metadata.last_fired_at;
            if won {
                r.metadata.last_fired_at = Some(now);
                r.metadata.execute_requested = false;
            }
        });
        match claimed {
            Ok(claimed) if won => Some(claimed),
            Ok(_) => None,
            Err(e) => {
                warn!(policy = %id, "could not claim snapshot run: {e}");
                None
            }
        }
    }

    /// Run one executor step for a snapshot policy on a blocking thread,
    /// bounded by `step_timeout`.
    async fn run_step(
        &self,
        policy: &str,
        kind: StepKind,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> StepOutcome {
        let executor = self.executor.clone();
        let policy = policy.to_string();
        let identity = identity.clone();
        let step = kind.name();
        let task = tokio::task::spawn_blocking(move || {
            executor.execute(&policy, &kind, &identity, &Unfenced, now)
        });
        bounded_step(task, self.config.step_timeout, step).await
    }

    /// Run the `create-snapshot` step for `record` and record the result.
    async fn take_snapshot(
        &self,
        record: &SnapshotPolicyRecord,
        now: DateTime<Utc>,
    ) -> DaemonResult<(String, StepOutcome)> {
        let policy = &record.policy;
        let name = policy.generate_snapshot_name(now);
        let outcome = match &policy.identity {
            Some(identity) => {
                self.run_step(&policy.id, policy.create_step(&name), identity, now)
                    .await
            }
            None => StepOutcome::failed(
                ErrorKind::NonRetryableExecutionError,
                format!("snapshot policy [{}] has no execution identity", policy.id),
            ),
        };
        match &outcome {
            StepOutcome::Failed(err) => {
                warn!(policy = %policy.id, snapshot = %name, kind = %err.kind, "snapshot failed: {}", err.reason)
            }
            _ => info!(policy = %policy.id, snapshot = %name, "snapshot taken"),
        }
        let entry = history_entry(HistoryOperation::Create, &name, &outcome, now);
        self.record_history(&policy.id, entry).await?;
        Ok((name, outcome))
    }

    async fn record_history(&self, id: &str, entry: HistoryEntry) -> DaemonResult<()> {
        let store = self.store.clone();
        let id = id.to_string();
        let limit = self.config.slm.history_limit;
        blocking(move || {
            match admin::update_snapshot_policy(store.as_ref(), &id, |r| {
                r.metadata.record(entry.clone(), limit)
            }) {
                Ok(_) => Ok(()),
                // Deleted while the step ran; there is nowhere to record it.
                Err(LifecycleError::SnapshotPolicyNotFound(_)) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    fn retention_due(&self, now: DateTime<Utc>) -> DaemonResult<bool> {
        if self.store.retention_requested()? {
            return Ok(true);
        }
        let cron = CronSchedule::parse(&self.config.slm.retention_schedule)?;
        match self.store.last_retention()? {
            Some(last) => Ok(schedule::is_due(&cron, Some(last), now)),
            None => {
                // Start the schedule clock on the first tick.
                self.store.set_last_retention(now)?;
                Ok(false)
            }
        }
    }

    /// Snapshots in `policy`'s repository taken by that policy.
    async fn policy_snapshots(&self, policy: &SnapshotPolicy) -> DaemonResult<Vec<SnapshotInfo>> {
        let this = self.clone();
        let repository = policy.repository.clone();
        let id = policy.id.clone();
        let listing = blocking(move || {
            Ok(this
                .executor
                .repository()
                .list_snapshots(&repository)?
                .into_iter()
                .filter(|s| s.policy.as_deref() == Some(id.as_str()))
                .collect::<Vec<_>>())
        });
        let timeout = self.config.step_timeout;
        match tokio::time::timeout(timeout.to_std(), listing).await {
            Ok(listed) => listed,
            Err(_) => Err(DaemonError::Step(StepError::new(
                ErrorKind::Timeout,
                format!("listing [{}] did not finish within [{timeout}]", policy.repository),
            ))),
        }
    }

    /// Delete every snapshot the policies' retention rules select. Bounded
    /// by `slm.retention_max_duration`; the remainder waits for the next pass.
    /// Callers hold the retention lock.
    async fn run_retention(&self, now: DateTime<Utc>) -> DaemonResult<RetentionReport> {
        let started = Instant::now();
        let budget = self.config.slm.retention_max_duration.to_std();
        let mut report = RetentionReport::default();

        // Cleared on claim: a request made during this pass runs on the next tick.
        let store = self.store.clone();
        let records = blocking(move || {
            store.set_retention_requested(false)?;
            Ok(store.list_snapshot_policies()?)
        })
        .await?;

        'policies: for record in records {
            let policy = &record.policy;
            let Some(rules) = policy.retention.as_ref().filter(|r| !r.is_empty()) else {
                continue;
            };
            let Some(identity) = &policy.identity else {
                continue;
            };
            let snapshots = match self.policy_snapshots(policy).await {
                Ok(snapshots) => snapshots,
                Err(e) => {
                    warn!(policy = %policy.id, repository = %policy.repository, "cannot list snapshots: {e}");
                    report.failed += 1;
                    continue;
                }
            };
            for victim in retention::select_for_deletion(rules, &snapshots, now) {
                if started.elapsed() >= budget {
                    report.timed_out = true;
                    break 'policies;
                }
                let kind = StepKind::DeleteSnapshot {
                    repository: policy.repository.clone(),
                    snapshot: victim.name.clone(),
                };
                let outcome = self.run_step(&policy.id, kind, identity, now).await;
                let entry = history_entry(HistoryOperation::Delete, &victim.name, &outcome, now);
                self.record_history(&policy.id, entry).await?;
                match outcome {
                    StepOutcome::Failed(err) => {
                        warn!(policy = %policy.id, snapshot = %victim.name, kind = %err.kind, "retention delete failed: {}", err.reason);
                        report.failed += 1;
                    }
                    _ => {
                        debug!(policy = %policy.id, snapshot = %victim.name, "snapshot deleted by retention");
                        report.deleted.push(victim.name);
                    }
                }
            }
        }

        if report.timed_out {
            warn!("retention pass exceeded [{}]", self.config.slm.retention_max_duration);
        }
        let store = self.store.clone();
        let elapsed = started.elapsed().as_millis() as u64;
        let (failed, timed_out) = (report.failed > 0, report.timed_out);
        blocking(move || {
            let mut stats = store.retention_stats()?;
            stats.retention_runs += 1;
            if failed {
                stats.retention_failed += 1;
            }
            if timed_out {
                stats.retention_timed_out += 1;
            }
            stats.retention_deletion_time_millis += elapsed;
            store.set_retention_stats(&stats)?;
            Ok(store.set_last_retention(now)?)
        })
        .await?;
        info!(deleted = report.deleted.len(), failed = report.failed, "retention pass finished");
        Ok(report)
    }
}

fn history_entry(
    operation: HistoryOperation,
    snapshot: &str,
    outcome: &StepOutcome,
    now: DateTime<Utc>,
) -> HistoryEntry {
    HistoryEntry {
        operation,
        snapshot_name: snapshot.to_string(),
        time: now,
        success: !matches!(outcome, StepOutcome::Failed(_)),
        details: match outcome {
            StepOutcome::Failed(err) => serde_json::to_string(err).ok(),
            _ => None,
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
