//! Lifecycle policy model: phases → actions → ordered steps.
//!
//! A policy is immutable once stored; storing it again replaces it and bumps
//! its version. Actions expand into `StepKind`s at runtime, so the persisted
//! policy only carries intent and parameters.

use crate::engine::IndexStats;
use crate::error::{LifecycleError, Result};
use crate::oracle::Identity;
use crate::paths;
use crate::step::StepKind;
use crate::types::{StepKey, TimeValue, COMPLETED, NEW_PHASE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// RolloverConditions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolloverConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_docs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<TimeValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_primary_size_bytes: Option<u64>,
}

impl RolloverConditions {
    pub fn is_empty(&self) -> bool {
        self.max_docs.is_none() && self.max_age.is_none() && self.max_primary_size_bytes.is_none()
    }

    /// Descriptions of the conditions `stats` satisfies at `now`.
    pub fn met(&self, stats: &IndexStats, now: DateTime<Utc>) -> Vec<String> {
        let mut met = Vec::new();
        if let Some(max) = self.max_docs {
            if stats.docs >= max {
                met.push(format!("[max_docs: {max}]"));
            }
        }
        if let Some(max) = self.max_age {
            if now - stats.created_at >= max.to_chrono() {
                met.push(format!("[max_age: {max}]"));
            }
        }
        if let Some(max) = self.max_primary_size_bytes {
            if stats.primary_size_bytes >= max {
                met.push(format!("[max_primary_size_bytes: {max}]"));
            }
        }
        met
    }
}

// ---------------------------------------------------------------------------
// LifecycleAction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleAction {
    Rollover(RolloverConditions),
    #[serde(rename = "readonly")]
    ReadOnly,
    SetPriority {
        priority: i64,
    },
    Delete {
        #[serde(default = "default_true")]
        delete_searchable_snapshot: bool,
    },
}

fn default_true() -> bool {
    true
}

impl LifecycleAction {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleAction::Rollover(_) => "rollover",
            LifecycleAction::ReadOnly => "readonly",
            LifecycleAction::SetPriority { .. } => "set_priority",
            LifecycleAction::Delete { .. } => "delete",
        }
    }

    /// Ordered steps this action decomposes into.
    pub fn steps(&self) -> Vec<StepKind> {
        match self {
            LifecycleAction::Rollover(conditions) => vec![
                StepKind::CheckRolloverReady {
                    conditions: conditions.clone(),
                },
                StepKind::AttemptRollover,
                StepKind::SetIndexingComplete,
            ],
            LifecycleAction::ReadOnly => vec![StepKind::ReadOnly],
            LifecycleAction::SetPriority { priority } => vec![StepKind::SetPriority {
                priority: *priority,
            }],
            LifecycleAction::Delete {
                delete_searchable_snapshot,
            } => vec![
                StepKind::WaitForShardHistoryLeases,
                StepKind::DeleteIndex {
                    delete_searchable_snapshot: *delete_searchable_snapshot,
                },
            ],
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            LifecycleAction::Rollover(conditions) if conditions.is_empty() => Err(
                "rollover requires at least one of max_docs, max_age, max_primary_size_bytes"
                    .to_string(),
            ),
            LifecycleAction::Rollover(RolloverConditions {
                max_docs: Some(0), ..
            }) => Err("rollover max_docs must be positive".to_string()),
            LifecycleAction::SetPriority { priority } if *priority < 0 => {
                Err(format!("set_priority priority must be >= 0, got {priority}"))
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    #[serde(default)]
    pub min_age: TimeValue,
    #[serde(default)]
    pub actions: Vec<LifecycleAction>,
}

impl Phase {
    pub fn new(name: impl Into<String>, min_age: TimeValue, actions: Vec<LifecycleAction>) -> Self {
        Self {
            name: name.into(),
            min_age,
            actions,
        }
    }

    /// All steps of this phase in execution order.
    pub fn steps(&self) -> Vec<PolicyStep> {
        self.actions
            .iter()
            .flat_map(|action| {
                action.steps().into_iter().map(move |kind| PolicyStep {
                    key: StepKey::new(&self.name, action.name(), kind.name()),
                    kind,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// PolicyStep / Advance
// ---------------------------------------------------------------------------

/// A step resolved against a policy: its pointer plus what to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyStep {
    pub key: StepKey,
    pub kind: StepKind,
}

/// Where the pointer goes after a step succeeds.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    Step(StepKey),
    /// Every action of the phase is done; the next phase waits on its gate.
    PhaseComplete(String),
    /// The policy is exhausted.
    Completed,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub version: u64,
    #[serde(default = "Utc::now")]
    pub modified_date: DateTime<Utc>,
    /// Identity whose privileges gate steps for indices discovered under this
    /// policy. Set to the caller when the policy is stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
}

impl Policy {
    pub fn new(name: impl Into<String>, phases: Vec<Phase>) -> Self {
        Self {
            name: name.into(),
            phases,
            version: 0,
            modified_date: Utc::now(),
            identity: None,
        }
    }

    /// Single-phase policy holding one action, the common shape in tests and
    /// quick setups.
    pub fn singleton(
        name: impl Into<String>,
        phase: impl Into<String>,
        min_age: TimeValue,
        action: LifecycleAction,
    ) -> Self {
        Self::new(name, vec![Phase::new(phase, min_age, vec![action])])
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| LifecycleError::InvalidPolicy {
            policy: self.name.clone(),
            reason,
        };

        paths::validate_name(&self.name).map_err(invalid)?;
        if self.phases.is_empty() {
            return Err(invalid("policy must define at least one phase".to_string()));
        }

        let mut phase_names = HashSet::new();
        for phase in &self.phases {
            if phase.name.is_empty() {
                return Err(invalid("phase names must not be empty".to_string()));
            }
            if phase.name == NEW_PHASE || phase.name == COMPLETED {
                return Err(invalid(format!("phase name '{}' is reserved", phase.name)));
            }
            if !phase_names.insert(phase.name.as_str()) {
                return Err(invalid(format!("duplicate phase '{}'", phase.name)));
            }

            let mut action_names = HashSet::new();
            for action in &phase.actions {
                if !action_names.insert(action.name()) {
                    return Err(invalid(format!(
                        "duplicate action '{}' in phase '{}'",
                        action.name(),
                        phase.name
                    )));
                }
                action
                    .validate()
                    .map_err(|reason| invalid(format!("phase '{}': {reason}", phase.name)))?;
            }
        }

        // A delete removes the index, so nothing may be scheduled after it.
        let all_actions: Vec<&LifecycleAction> =
            self.phases.iter().flat_map(|p| p.actions.iter()).collect();
        if let Some(pos) = all_actions
            .iter()
            .position(|a| matches!(a, LifecycleAction::Delete { .. }))
        {
            if pos + 1 != all_actions.len() {
                return Err(invalid(
                    "delete must be the last action of the policy".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// The phase that follows `current`. For the `new` sentinel this is the
    /// first phase.
    pub fn next_phase(&self, current: &str) -> Option<&Phase> {
        if current == NEW_PHASE {
            return self.phases.first();
        }
        let idx = self.phases.iter().position(|p| p.name == current)?;
        self.phases.get(idx + 1)
    }

    /// Pointer a resource takes when it enters `phase`.
    pub fn entry_point(&self, phase: &Phase) -> StepKey {
        phase
            .steps()
            .into_iter()
            .next()
            .map(|s| s.key)
            .unwrap_or_else(|| StepKey::phase_complete(&phase.name))
    }

    /// Resolve an executable step. `None` when the policy no longer has it.
    pub fn step(&self, key: &StepKey) -> Option<PolicyStep> {
        self.phase(&key.phase)?
            .steps()
            .into_iter()
            .find(|s| &s.key == key)
    }

    /// True if `key` is an executable step or the phase-complete sentinel of
    /// a phase in this policy.
    pub fn contains(&self, key: &StepKey) -> bool {
        if key.is_phase_boundary() {
            return self.phase(&key.phase).is_some();
        }
        self.step(key).is_some()
    }

    /// Pointer after `key` succeeds.
    pub fn advance(&self, key: &StepKey) -> Option<Advance> {
        let phase = self.phase(&key.phase)?;
        let steps = phase.steps();
        let idx = steps.iter().position(|s| &s.key == key)?;
        if let Some(next) = steps.get(idx + 1) {
            return Some(Advance::Step(next.key.clone()));
        }
        if self.next_phase(&phase.name).is_none() {
            return Some(Advance::Completed);
        }
        Some(Advance::PhaseComplete(phase.name.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
