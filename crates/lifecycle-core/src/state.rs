//! Per-index lifecycle state and its pure transitions.
//!
//! Every function here mutates a `LifecycleState` in memory only; persisting
//! the result (with a version check) is the caller's job. That keeps the
//! transitions testable without a store, an engine or a clock.

use crate::config::RetryConfig;
use crate::error::{LifecycleError, Result};
use crate::oracle::Identity;
use crate::policy::{Advance, Policy};
use crate::step::{ErrorKind, StepError};
use crate::types::{ExecutionStatus, StepKey, NEW_PHASE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `step` value reported by explain while a resource is errored.
pub const ERROR_STEP: &str = "ERROR";

// ---------------------------------------------------------------------------
// LifecycleState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleState {
    pub index: String,
    pub policy: String,
    pub step: StepKey,
    pub status: ExecutionStatus,
    /// Failures of the current step. Reset only when the pointer moves.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StepError>,
    #[serde(default)]
    pub is_auto_retryable_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_info: Option<serde_json::Value>,
    pub identity: Identity,
    pub lifecycle_date: DateTime<Utc>,
    pub phase_time: DateTime<Utc>,
    pub action_time: DateTime<Utc>,
    pub step_time: DateTime<Utc>,
    /// First failure of the current error streak.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_since: Option<DateTime<Utc>>,
    /// Most recent failure; the backoff reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every successful conditional write.
    #[serde(default)]
    pub version: u64,
}

/// Result of evaluating the phase gate.
#[derive(Debug, Clone, PartialEq)]
pub enum Gate {
    /// The next phase was entered; the pointer now sits on its first step.
    Entered(String),
    /// `min_age` has not elapsed yet; nothing changed.
    NotYet { remaining: chrono::Duration },
    /// No phase follows; the state is now `completed`.
    Completed,
}

impl LifecycleState {
    /// A freshly bound resource, parked on the `new` sentinel.
    pub fn new(
        index: impl Into<String>,
        policy: impl Into<String>,
        identity: Identity,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            index: index.into(),
            policy: policy.into(),
            step: StepKey::initial(),
            status: ExecutionStatus::Pending,
            retry_count: 0,
            last_error: None,
            is_auto_retryable_error: false,
            step_info: None,
            identity,
            lifecycle_date: now,
            phase_time: now,
            action_time: now,
            step_time: now,
            error_since: None,
            last_failure_at: None,
            version: 0,
        }
    }

    /// The pointer sits on a sentinel and waits for the phase gate.
    pub fn at_phase_boundary(&self) -> bool {
        self.step.is_phase_boundary() && !self.step.is_terminal()
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// Whether the orchestrator may attempt this record at `now`.
    pub fn is_due(&self, retry: &RetryConfig, now: DateTime<Utc>) -> bool {
        match self.status {
            ExecutionStatus::Pending => true,
            ExecutionStatus::Executing | ExecutionStatus::Completed => false,
            ExecutionStatus::Error => {
                if !self.is_auto_retryable_error {
                    return false;
                }
                let delay = retry.backoff(self.retry_count);
                match self.last_failure_at {
                    Some(at) if !delay.is_zero() => now - at >= delay.to_chrono(),
                    _ => true,
                }
            }
        }
    }

    fn move_to(&mut self, key: StepKey, now: DateTime<Utc>) {
        if key != self.step {
            self.retry_count = 0;
        }
        if key.phase != self.step.phase {
            self.phase_time = now;
        }
        if key.phase != self.step.phase || key.action != self.step.action {
            self.action_time = now;
        }
        self.step_time = now;
        self.status = if key.is_terminal() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Pending
        };
        self.step = key;
        self.clear_error();
        self.step_info = None;
    }

    fn clear_error(&mut self) {
        self.last_error = None;
        self.is_auto_retryable_error = false;
        self.error_since = None;
        self.last_failure_at = None;
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// The current step succeeded: move to the next step, the phase-complete
    /// sentinel, or `completed`.
    pub fn advance(&mut self, policy: &Policy, now: DateTime<Utc>) -> std::result::Result<(), StepError> {
        let next = policy.advance(&self.step).ok_or_else(|| self.missing_step_error(policy))?;
        let key = match next {
            Advance::Step(key) => key,
            Advance::PhaseComplete(phase) => StepKey::phase_complete(&phase),
            Advance::Completed => StepKey::terminal(),
        };
        self.move_to(key, now);
        Ok(())
    }

    /// A condition step is not satisfied yet. Not a failure: the counter is
    /// left alone and the error, if any, is cleared.
    pub fn wait(&mut self, info: serde_json::Value) {
        self.status = ExecutionStatus::Pending;
        self.clear_error();
        self.step_info = Some(info);
    }

    /// Record a failed attempt of the current step.
    pub fn fail(&mut self, error: StepError, now: DateTime<Utc>, retry: &RetryConfig) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.status = ExecutionStatus::Error;
        self.is_auto_retryable_error = error.is_retryable() && retry.allows_retry(self.retry_count);
        self.error_since.get_or_insert(now);
        self.last_failure_at = Some(now);
        self.step_info = None;
        self.last_error = Some(error);
    }

    /// Enter the next phase once its `min_age` has elapsed. Only meaningful
    /// on a boundary sentinel.
    pub fn phase_gate(&mut self, policy: &Policy, now: DateTime<Utc>) -> std::result::Result<Gate, StepError> {
        let current = self.step.phase.clone();
        if current != NEW_PHASE && policy.phase(&current).is_none() {
            return Err(self.missing_step_error(policy));
        }
        let Some(next) = policy.next_phase(&current) else {
            self.move_to(StepKey::terminal(), now);
            return Ok(Gate::Completed);
        };
        let reference = if current == NEW_PHASE {
            self.lifecycle_date
        } else {
            self.phase_time
        };
        let elapsed = now - reference;
        let min_age = next.min_age.to_chrono();
        if elapsed < min_age {
            return Ok(Gate::NotYet {
                remaining: min_age - elapsed,
            });
        }
        let name = next.name.clone();
        let entry = policy.entry_point(next);
        self.move_to(entry, now);
        Ok(Gate::Entered(name))
    }

    /// Administrative override of the pointer. Rejected targets leave the
    /// state untouched. `expected`, when given, must match the current step.
    pub fn force_move(
        &mut self,
        policy: &Policy,
        expected: Option<&StepKey>,
        target: StepKey,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let invalid = |reason: String| LifecycleError::InvalidMove {
            index: self.index.clone(),
            reason,
        };
        if let Some(expected) = expected {
            if expected != &self.step {
                return Err(invalid(format!(
                    "current step is {}, not {expected}",
                    self.step
                )));
            }
        }
        if !policy.contains(&target) {
            return Err(invalid(format!(
                "step {target} is not part of policy '{}'",
                policy.name
            )));
        }
        // Moving onto the same step still starts it afresh.
        self.retry_count = 0;
        self.move_to(target, now);
        Ok(())
    }

    /// Administrative retry of an errored step. Keeps the failure counter.
    pub fn retry(&mut self) -> Result<()> {
        if self.status != ExecutionStatus::Error {
            return Err(LifecycleError::InvalidRetry {
                index: self.index.clone(),
                reason: format!("status is {}, not error", self.status),
            });
        }
        self.status = ExecutionStatus::Pending;
        self.is_auto_retryable_error = true;
        Ok(())
    }

    /// `phase_not_found` error for a pointer the policy no longer contains.
    pub fn missing_step_error(&self, policy: &Policy) -> StepError {
        if policy.phase(&self.step.phase).is_none() {
            StepError::new(
                ErrorKind::PhaseNotFound,
                format!(
                    "phase [{}] not found in policy [{}]",
                    self.step.phase, policy.name
                ),
            )
        } else {
            StepError::new(
                ErrorKind::PhaseNotFound,
                format!(
                    "step [{}] not found in policy [{}]",
                    self.step, policy.name
                ),
            )
        }
    }

    // -----------------------------------------------------------------------
    // Explain
    // -----------------------------------------------------------------------

    pub fn explain(&self) -> Explain {
        let errored = self.status == ExecutionStatus::Error;
        Explain {
            index: self.index.clone(),
            managed: true,
            policy: Some(self.policy.clone()),
            phase: Some(self.step.phase.clone()),
            action: Some(self.step.action.clone()),
            step: Some(if errored {
                ERROR_STEP.to_string()
            } else {
                self.step.name.clone()
            }),
            status: Some(self.status),
            failed_step: errored.then(|| self.step.name.clone()),
            step_info: match (&self.last_error, &self.step_info) {
                (Some(err), _) if errored => serde_json::to_value(err).ok(),
                (_, info) => info.clone(),
            },
            failed_step_retry_count: (self.retry_count > 0).then_some(self.retry_count),
            is_auto_retryable_error: errored.then_some(self.is_auto_retryable_error),
            error_since: self.error_since,
            lifecycle_date: Some(self.lifecycle_date),
            phase_time: Some(self.phase_time),
            action_time: Some(self.action_time),
            step_time: Some(self.step_time),
            identity: Some(self.identity.principal.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Explain
// ---------------------------------------------------------------------------

/// Operator-facing view of one index's lifecycle position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explain {
    pub index: String,
    pub managed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_info: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_auto_retryable_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl Explain {
    pub fn unmanaged(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            managed: false,
            policy: None,
            phase: None,
            action: None,
            step: None,
            status: None,
            failed_step: None,
            step_info: None,
            failed_step_retry_count: None,
            is_auto_retryable_error: None,
            error_since: None,
            lifecycle_date: None,
            phase_time: None,
            action_time: None,
            step_time: None,
            identity: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
