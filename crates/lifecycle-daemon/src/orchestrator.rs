//! The ILM control loop.
//!
//! A tick discovers indices that name a stored policy, drops records of
//! indices that no longer exist, then gives every managed record at most one
//! advancement: either a phase-gate evaluation or one step execution.
//!
//! # Claim / execute / commit
//!
//! ```text
//! pending ──put(Version(v))──▶ executing(v+1) ──execute──▶ outcome
//!                                      │
//!                                      └──put(Version(v+1))──▶ next state
//! ```
//!
//! Both writes are conditional. An administrative override in between bumps
//! the version, so the commit fails and the outcome is discarded. The store
//! is the only state; nothing is cached across ticks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lifecycle_core::admin;
use lifecycle_core::config::Config;
use lifecycle_core::executor::StepExecutor;
use lifecycle_core::policy::Policy;
use lifecycle_core::state::{Gate, LifecycleState};
use lifecycle_core::step::{ErrorKind, StepError, StepKind, StepOutcome};
use lifecycle_core::store::{Expect, LifecycleStore, MetaExt, Subsystem};
use lifecycle_core::types::{ExecutionStatus, OperationMode, StepKey};
use lifecycle_core::LifecycleError;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::DaemonResult;
use crate::util::{blocking, bounded_step};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// What one tick did to one managed record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Advancement {
    /// Nothing to do: completed, not due, or waiting on a phase's `min_age`.
    Idle,
    /// The record is still locked by an overrunning tick.
    Busy,
    EnteredPhase { phase: String },
    Stepped { step: StepKey },
    /// The policy is exhausted.
    Finished,
    Waiting,
    Removed,
    Failed { kind: ErrorKind },
    /// An administrative write won the race; the outcome was dropped.
    Superseded,
    /// Infrastructure failure (store, runtime); the record is untouched.
    Error { message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub mode: OperationMode,
    pub discovered: usize,
    pub cleaned_up: usize,
    pub resources: BTreeMap<String, Advancement>,
}

impl TickReport {
    pub fn advancement(&self, index: &str) -> Option<&Advancement> {
        self.resources.get(index)
    }

    pub fn count(&self, pred: impl Fn(&Advancement) -> bool) -> usize {
        self.resources.values().filter(|a| pred(a)).count()
    }
}

/// First half of an advancement, decided under the resource lock.
enum Prepared {
    Done(Advancement),
    Claimed {
        state: LifecycleState,
        policy: Policy,
        kind: StepKind,
    },
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn LifecycleStore>,
    executor: StepExecutor,
    config: Arc<Config>,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn LifecycleStore>, executor: StepExecutor, config: Arc<Config>) -> Self {
        Self {
            store,
            executor,
            config,
            locks: Arc::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn LifecycleStore> {
        &self.store
    }

    /// Reset records left `executing` by a previous process. Steps are
    /// idempotent, so they simply run again.
    pub async fn recover(&self) -> DaemonResult<usize> {
        let store = self.store.clone();
        blocking(move || {
            let mut reset = 0;
            for mut state in store.list_states()? {
                if state.status != ExecutionStatus::Executing {
                    continue;
                }
                let expect = Expect::Version(state.version);
                state.status = ExecutionStatus::Pending;
                match store.put_state(&state, expect) {
                    Ok(_) => reset += 1,
                    Err(LifecycleError::VersionConflict { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if reset > 0 {
                info!(count = reset, "reset interrupted steps to pending");
            }
            Ok(reset)
        })
        .await
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> DaemonResult<TickReport> {
        let this = self.clone();
        let mode = blocking(move || this.settle_mode()).await?;
        let mut report = TickReport {
            mode,
            ..Default::default()
        };
        if mode != OperationMode::Running {
            debug!(mode = %mode, "ilm is not running; skipping tick");
            return Ok(report);
        }

        let this = self.clone();
        match blocking(move || this.discover(now)).await {
            Ok((discovered, cleaned_up)) => {
                report.discovered = discovered;
                report.cleaned_up = cleaned_up;
            }
            Err(e) => warn!("index discovery failed: {e}"),
        }

        let store = self.store.clone();
        let indices: Vec<String> = blocking(move || Ok(store.list_states()?))
            .await?
            .into_iter()
            .filter(|s| !s.is_completed())
            .map(|s| s.index)
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();
        for index in indices {
            let this = self.clone();
            let sem = semaphore.clone();
            tasks.spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return (index, Advancement::Busy),
                };
                let advancement = this.advance_resource(&index, now).await;
                (index, advancement)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, advancement)) => {
                    report.resources.insert(index, advancement);
                }
                Err(e) => warn!("resource task failed: {e}"),
            }
        }
        Ok(report)
    }

    /// `stopping` settles on `stopped` once no step is in flight.
    fn settle_mode(&self) -> DaemonResult<OperationMode> {
        let mode = self.store.operation_mode(Subsystem::Ilm)?;
        if mode != OperationMode::Stopping {
            return Ok(mode);
        }
        let in_flight = self
            .store
            .list_states()?
            .iter()
            .any(|s| s.status == ExecutionStatus::Executing);
        if in_flight {
            return Ok(mode);
        }
        self.store
            .set_operation_mode(Subsystem::Ilm, OperationMode::Stopped)?;
        info!("ilm stopped");
        Ok(OperationMode::Stopped)
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Bind indices whose settings name a stored policy and drop records of
    /// indices that are gone. Returns `(discovered, cleaned_up)`.
    fn discover(&self, now: DateTime<Utc>) -> DaemonResult<(usize, usize)> {
        let indices = self.executor.engine().list_indices()?;
        let managed: HashSet<String> = self
            .store
            .list_states()?
            .into_iter()
            .map(|s| s.index)
            .collect();

        let mut discovered = 0;
        for info in &indices {
            let Some(policy) = info.settings.lifecycle_name.as_deref() else {
                continue;
            };
            if managed.contains(&info.name) {
                continue;
            }
            if self.store.get_policy(policy)?.is_none() {
                debug!(index = %info.name, policy, "index names an unknown policy");
                continue;
            }
            match admin::bind(self.store.as_ref(), &info.name, policy, None, now) {
                Ok(_) => discovered += 1,
                Err(e) => warn!(index = %info.name, policy, "could not manage index: {e}"),
            }
        }

        let present: HashSet<&str> = indices.iter().map(|i| i.name.as_str()).collect();
        let mut cleaned_up = 0;
        for index in managed.iter().filter(|i| !present.contains(i.as_str())) {
            if self.store.delete_state(index)? {
                info!(index = %index, "index no longer exists; dropped lifecycle state");
                cleaned_up += 1;
            }
            self.locks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(index);
        }
        Ok((discovered, cleaned_up))
    }

    // -----------------------------------------------------------------------
    // Per-resource advancement
    // -----------------------------------------------------------------------

    fn lock_for(&self, index: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(index.to_string()).or_default().clone()
    }

    async fn advance_resource(&self, index: &str, now: DateTime<Utc>) -> Advancement {
        let Ok(guard) = self.lock_for(index).try_lock_owned() else {
            debug!(index, "still busy from a previous tick");
            return Advancement::Busy;
        };
        match self.try_advance(index, now, Arc::new(guard)).await {
            Ok(advancement) => advancement,
            Err(e) => {
                warn!(index, "lifecycle advancement failed: {e}");
                Advancement::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    async fn try_advance(
        &self,
        index: &str,
        now: DateTime<Utc>,
        guard: Arc<OwnedMutexGuard<()>>,
    ) -> DaemonResult<Advancement> {
        let this = self.clone();
        let target = index.to_string();
        let prepared = blocking(move || this.prepare(&target, now)).await?;
        let (state, policy, kind) = match prepared {
            Prepared::Done(advancement) => return Ok(advancement),
            Prepared::Claimed {
                state,
                policy,
                kind,
            } => (state, policy, kind),
        };

        let outcome = self.run_step(&state, kind, now, guard.clone()).await;
        let this = self.clone();
        blocking(move || this.commit(state, &policy, outcome, now)).await
    }

    /// Load the record and either settle it right here (phase gate, missing
    /// policy) or claim its current step for execution.
    fn prepare(&self, index: &str, now: DateTime<Utc>) -> DaemonResult<Prepared> {
        let Some(state) = self.store.get_state(index)? else {
            return Ok(Prepared::Done(Advancement::Idle));
        };
        if !state.is_due(&self.config.retry, now) {
            return Ok(Prepared::Done(Advancement::Idle));
        }

        let Some(policy) = self.store.get_policy(&state.policy)? else {
            let err = StepError::new(
                ErrorKind::PolicyNotFound,
                format!("policy [{}] does not exist", state.policy),
            );
            return self.record_failure(state, err, now).map(Prepared::Done);
        };
        // Stored policies are validated on write; this catches records
        // written around that path.
        if let Err(e) = policy.validate() {
            let err = StepError::new(ErrorKind::PolicyInvalid, e.to_string());
            return self.record_failure(state, err, now).map(Prepared::Done);
        }

        if state.at_phase_boundary() {
            return self.evaluate_gate(state, &policy, now).map(Prepared::Done);
        }

        let Some(step) = policy.step(&state.step) else {
            let err = state.missing_step_error(&policy);
            return self.record_failure(state, err, now).map(Prepared::Done);
        };

        let expect = Expect::Version(state.version);
        let mut claim = state;
        claim.status = ExecutionStatus::Executing;
        match self.store.put_state(&claim, expect) {
            Ok(claimed) => Ok(Prepared::Claimed {
                state: claimed,
                policy,
                kind: step.kind,
            }),
            Err(LifecycleError::VersionConflict { .. }) => {
                Ok(Prepared::Done(Advancement::Superseded))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn evaluate_gate(
        &self,
        state: LifecycleState,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> DaemonResult<Advancement> {
        let expect = Expect::Version(state.version);
        let mut next = state;
        let advancement = match next.phase_gate(policy, now) {
            Ok(Gate::NotYet { .. }) => return Ok(Advancement::Idle),
            Ok(Gate::Entered(phase)) => {
                info!(index = %next.index, phase = %phase, "entered phase");
                Advancement::EnteredPhase { phase }
            }
            Ok(Gate::Completed) => {
                info!(index = %next.index, policy = %policy.name, "lifecycle completed");
                Advancement::Finished
            }
            Err(err) => {
                return self.record_failure(next, err, now);
            }
        };
        self.write(&next, expect, advancement)
    }

    fn record_failure(
        &self,
        state: LifecycleState,
        err: StepError,
        now: DateTime<Utc>,
    ) -> DaemonResult<Advancement> {
        let expect = Expect::Version(state.version);
        let kind = err.kind;
        warn!(index = %state.index, step = %state.step, kind = %kind, "{}", err.reason);
        let mut next = state;
        next.fail(err, now, &self.config.retry);
        self.write(&next, expect, Advancement::Failed { kind })
    }

    fn write(
        &self,
        state: &LifecycleState,
        expect: Expect,
        advancement: Advancement,
    ) -> DaemonResult<Advancement> {
        match self.store.put_state(state, expect) {
            Ok(_) => Ok(advancement),
            Err(LifecycleError::VersionConflict { .. }) => {
                debug!(index = %state.index, "lifecycle state changed underneath; outcome dropped");
                Ok(Advancement::Superseded)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Execute the claimed step on a blocking thread, bounded by
    /// `step_timeout`. The fence re-reads the record right before the side
    /// effect. The thread holds the resource lock until it returns, so a step
    /// that outlives its timeout keeps the record `Busy` on later ticks.
    async fn run_step(
        &self,
        claimed: &LifecycleState,
        kind: StepKind,
        now: DateTime<Utc>,
        guard: Arc<OwnedMutexGuard<()>>,
    ) -> StepOutcome {
        let executor = self.executor.clone();
        let store = self.store.clone();
        let index = claimed.index.clone();
        let identity = claimed.identity.clone();
        let version = claimed.version;
        let step_name = kind.name();
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let fence = {
                let index = index.clone();
                move || matches!(store.get_state(&index), Ok(Some(s)) if s.version == version)
            };
            executor.execute(&index, &kind, &identity, &fence, now)
        });

        bounded_step(task, self.config.step_timeout, step_name).await
    }

    fn commit(
        &self,
        claimed: LifecycleState,
        policy: &Policy,
        outcome: StepOutcome,
        now: DateTime<Utc>,
    ) -> DaemonResult<Advancement> {
        let expect = Expect::Version(claimed.version);
        let mut next = claimed;
        let advancement = match outcome {
            StepOutcome::Complete => match next.advance(policy, now) {
                Ok(()) if next.is_completed() => {
                    info!(index = %next.index, policy = %policy.name, "lifecycle completed");
                    Advancement::Finished
                }
                Ok(()) => {
                    debug!(index = %next.index, step = %next.step, "advanced");
                    Advancement::Stepped {
                        step: next.step.clone(),
                    }
                }
                Err(err) => return self.record_failure(next, err, now),
            },
            StepOutcome::Waiting { info } => {
                next.wait(info);
                Advancement::Waiting
            }
            StepOutcome::Removed => {
                self.store.delete_state(&next.index)?;
                info!(index = %next.index, "index deleted; lifecycle ended");
                return Ok(Advancement::Removed);
            }
            StepOutcome::Failed(err) if err.kind == ErrorKind::Superseded => {
                debug!(index = %next.index, "{}", err.reason);
                return Ok(Advancement::Superseded);
            }
            StepOutcome::Failed(err) => return self.record_failure(next, err, now),
        };
        self.write(&next, expect, advancement)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
