//! Executes exactly one step for one target under a bound identity.
//!
//! Order per execution:
//! 1. every `(action, resource)` pair the step requires is authorized;
//! 2. the fence confirms the record was not superseded meanwhile;
//! 3. the handler for the step kind runs (see `HANDLERS`);
//! 4. collaborator errors are classified into `StepOutcome::Failed`.
//!
//! Handlers check before they apply, so running a step twice has the same
//! effect as running it once.

use crate::engine::{EngineError, IndexEngine, IndexSettings, SettingsUpdate};
use crate::oracle::{Decision, Identity, PermissionOracle};
use crate::repository::{SnapshotRepository, SnapshotRequest, SnapshotState};
use crate::step::{ErrorKind, StepError, StepKind, StepOutcome};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Fence
// ---------------------------------------------------------------------------

/// Version check run immediately before a side effect.
pub trait Fence: Send + Sync {
    fn is_current(&self) -> bool;
}

impl<F: Fn() -> bool + Send + Sync> Fence for F {
    fn is_current(&self) -> bool {
        self()
    }
}

/// Fence for executions that are not tied to a stored record.
pub struct Unfenced;

impl Fence for Unfenced {
    fn is_current(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// StepContext / handler table
// ---------------------------------------------------------------------------

pub struct StepContext<'a> {
    /// Managed index, or snapshot policy id for snapshot steps.
    pub target: &'a str,
    pub kind: &'a StepKind,
    pub identity: &'a Identity,
    pub engine: &'a dyn IndexEngine,
    pub repository: &'a dyn SnapshotRepository,
    pub now: DateTime<Utc>,
}

/// A handler either produces an outcome or reports a fault for the
/// classification table.
enum Fault {
    Engine(EngineError),
    Step(StepError),
}

impl From<EngineError> for Fault {
    fn from(e: EngineError) -> Self {
        Fault::Engine(e)
    }
}

type HandlerResult = std::result::Result<StepOutcome, Fault>;

struct Handler {
    step: &'static str,
    run: fn(&StepContext<'_>) -> HandlerResult,
}

const HANDLERS: &[Handler] = &[
    Handler {
        step: "check-rollover-ready",
        run: check_rollover_ready,
    },
    Handler {
        step: "attempt-rollover",
        run: attempt_rollover,
    },
    Handler {
        step: "set-indexing-complete",
        run: set_indexing_complete,
    },
    Handler {
        step: "wait-for-shard-history-leases",
        run: wait_for_shard_history_leases,
    },
    Handler {
        step: "delete",
        run: delete_index,
    },
    Handler {
        step: "read-only",
        run: read_only,
    },
    Handler {
        step: "set-priority",
        run: set_priority,
    },
    Handler {
        step: "create-snapshot",
        run: create_snapshot,
    },
    Handler {
        step: "delete-snapshot",
        run: delete_snapshot,
    },
];

fn handler_for(kind: &StepKind) -> Option<&'static Handler> {
    HANDLERS.iter().find(|h| h.step == kind.name())
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StepExecutor {
    oracle: Arc<dyn PermissionOracle>,
    engine: Arc<dyn IndexEngine>,
    repository: Arc<dyn SnapshotRepository>,
}

impl StepExecutor {
    pub fn new(
        oracle: Arc<dyn PermissionOracle>,
        engine: Arc<dyn IndexEngine>,
        repository: Arc<dyn SnapshotRepository>,
    ) -> Self {
        Self {
            oracle,
            engine,
            repository,
        }
    }

    pub fn oracle(&self) -> &Arc<dyn PermissionOracle> {
        &self.oracle
    }

    pub fn engine(&self) -> &Arc<dyn IndexEngine> {
        &self.engine
    }

    pub fn repository(&self) -> &Arc<dyn SnapshotRepository> {
        &self.repository
    }

    /// Run `kind` against `target`. Never panics or propagates: every result
    /// is a `StepOutcome`.
    pub fn execute(
        &self,
        target: &str,
        kind: &StepKind,
        identity: &Identity,
        fence: &dyn Fence,
        now: DateTime<Utc>,
    ) -> StepOutcome {
        if let Err(denied) = self.authorize(target, kind, identity) {
            debug!(index = target, step = kind.name(), identity = %identity, "step denied");
            return StepOutcome::Failed(denied);
        }
        if !fence.is_current() {
            return StepOutcome::failed(
                ErrorKind::Superseded,
                format!("lifecycle state of [{target}] changed while [{kind}] was running"),
            );
        }
        let Some(handler) = handler_for(kind) else {
            return StepOutcome::failed(
                ErrorKind::NonRetryableExecutionError,
                format!("no handler for step [{kind}]"),
            );
        };
        let ctx = StepContext {
            target,
            kind,
            identity,
            engine: self.engine.as_ref(),
            repository: self.repository.as_ref(),
            now,
        };
        match (handler.run)(&ctx) {
            Ok(outcome) => outcome,
            Err(fault) => {
                let outcome = classify(target, kind, fault);
                if let StepOutcome::Failed(err) = &outcome {
                    warn!(index = target, step = kind.name(), kind = %err.kind, "step failed: {}", err.reason);
                }
                outcome
            }
        }
    }

    /// Check every privilege the step requires; the first denial wins.
    pub fn authorize(
        &self,
        target: &str,
        kind: &StepKind,
        identity: &Identity,
    ) -> std::result::Result<(), StepError> {
        for (action, resource) in kind.required_privileges(target) {
            if let Decision::Deny(denial) = self.oracle.authorize(identity, action, &resource) {
                return Err(StepError::permission_denied(
                    action,
                    identity,
                    &resource,
                    denial.reason,
                    denial.required_privileges,
                ));
            }
        }
        Ok(())
    }
}

/// Map a handler fault onto an outcome. A missing target is success for
/// delete-type steps and unavailability everywhere else.
fn classify(target: &str, kind: &StepKind, fault: Fault) -> StepOutcome {
    let err = match fault {
        Fault::Step(err) => return StepOutcome::Failed(err),
        Fault::Engine(err) => err,
    };
    match err {
        EngineError::NotFound(_) if kind.is_delete() => match kind {
            StepKind::DeleteIndex { .. } => StepOutcome::Removed,
            _ => StepOutcome::Complete,
        },
        EngineError::NotFound(what) => StepOutcome::failed(
            ErrorKind::ResourceUnavailable,
            format!("[{what}] not found while running [{kind}] for [{target}]"),
        ),
        EngineError::Busy(_) | EngineError::Unavailable(_) | EngineError::Failed(_) => {
            StepOutcome::failed(ErrorKind::ResourceUnavailable, err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Rollover helpers
// ---------------------------------------------------------------------------

static ROLLOVER_RE: OnceLock<Regex> = OnceLock::new();

fn rollover_re() -> &'static Regex {
    ROLLOVER_RE.get_or_init(|| Regex::new(r"^(.*)-(\d+)$").unwrap())
}

/// Name of the index that follows `index` in its series: the numeric
/// suffix is incremented and zero-padded to six digits.
pub fn rollover_target(index: &str) -> Option<String> {
    let caps = rollover_re().captures(index)?;
    let prefix = caps.get(1)?.as_str();
    let n: u64 = caps.get(2)?.as_str().parse().ok()?;
    Some(format!("{prefix}-{:06}", n.checked_add(1)?))
}

fn rollover_alias(ctx: &StepContext<'_>, settings: &IndexSettings) -> std::result::Result<String, Fault> {
    match settings.rollover_alias.as_deref() {
        Some(alias) if !alias.is_empty() => Ok(alias.to_string()),
        _ => Err(Fault::Step(StepError::new(
            ErrorKind::NonRetryableExecutionError,
            format!(
                "setting [index.lifecycle.rollover_alias] for index [{}] is empty or not defined",
                ctx.target
            ),
        ))),
    }
}

/// Whether `alias` points at the target and whether the target is its
/// write index.
fn alias_membership(ctx: &StepContext<'_>, alias: &str) -> std::result::Result<bool, Fault> {
    let members = ctx.engine.alias_targets(alias)?;
    let Some(member) = members.iter().find(|m| m.index == ctx.target) else {
        return Err(Fault::Step(StepError::new(
            ErrorKind::StepPreconditionFailed,
            format!(
                "index.lifecycle.rollover_alias [{alias}] does not point to index [{}]",
                ctx.target
            ),
        )));
    };
    Ok(member.is_write_index || members.len() == 1)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn check_rollover_ready(ctx: &StepContext<'_>) -> HandlerResult {
    let StepKind::CheckRolloverReady { conditions } = ctx.kind else {
        return Err(Fault::Step(mismatch(ctx)));
    };
    let settings = ctx.engine.index_settings(ctx.target)?;
    if settings.indexing_complete {
        return Ok(StepOutcome::Complete);
    }
    let alias = rollover_alias(ctx, &settings)?;
    if !alias_membership(ctx, &alias)? {
        // Already rolled over by someone else.
        return Ok(StepOutcome::Complete);
    }
    let stats = ctx.engine.index_stats(ctx.target)?;
    let met = conditions.met(&stats, ctx.now);
    if !met.is_empty() {
        debug!(index = ctx.target, conditions = ?met, "rollover conditions met");
        return Ok(StepOutcome::Complete);
    }
    Ok(StepOutcome::Waiting {
        info: serde_json::json!({
            "message": "waiting for rollover conditions",
            "conditions": conditions,
            "docs": stats.docs,
            "primary_size_bytes": stats.primary_size_bytes,
        }),
    })
}

fn attempt_rollover(ctx: &StepContext<'_>) -> HandlerResult {
    let settings = ctx.engine.index_settings(ctx.target)?;
    let alias = rollover_alias(ctx, &settings)?;
    if !alias_membership(ctx, &alias)? {
        return Ok(StepOutcome::Complete);
    }
    let Some(next) = rollover_target(ctx.target) else {
        return Err(Fault::Step(StepError::new(
            ErrorKind::NonRetryableExecutionError,
            format!(
                "index name [{}] does not match pattern '^.*-\\d+$'",
                ctx.target
            ),
        )));
    };
    if !ctx.engine.index_exists(&next)? {
        let next_settings = IndexSettings {
            lifecycle_name: settings.lifecycle_name.clone(),
            rollover_alias: Some(alias.clone()),
            ..Default::default()
        };
        ctx.engine.create_index(&next, &next_settings)?;
    }
    ctx.engine.swap_write_alias(&alias, ctx.target, &next)?;
    debug!(index = ctx.target, rolled_to = %next, alias = %alias, "rolled over");
    Ok(StepOutcome::Complete)
}

fn set_indexing_complete(ctx: &StepContext<'_>) -> HandlerResult {
    ctx.engine.update_settings(
        ctx.target,
        &SettingsUpdate {
            indexing_complete: Some(true),
            ..Default::default()
        },
    )?;
    Ok(StepOutcome::Complete)
}

fn wait_for_shard_history_leases(ctx: &StepContext<'_>) -> HandlerResult {
    ctx.engine.index_stats(ctx.target)?;
    Ok(StepOutcome::Complete)
}

fn delete_index(ctx: &StepContext<'_>) -> HandlerResult {
    let StepKind::DeleteIndex {
        delete_searchable_snapshot,
    } = ctx.kind
    else {
        return Err(Fault::Step(mismatch(ctx)));
    };
    if *delete_searchable_snapshot {
        if let Some(backing) = ctx.engine.index_settings(ctx.target)?.searchable_snapshot {
            // Gone already when a previous attempt got this far.
            match ctx
                .repository
                .delete_snapshot(&backing.repository, &backing.snapshot)
            {
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            debug!(index = ctx.target, snapshot = %backing.snapshot, "deleted backing snapshot");
        }
    }
    ctx.engine.delete_index(ctx.target)?;
    Ok(StepOutcome::Removed)
}

fn read_only(ctx: &StepContext<'_>) -> HandlerResult {
    ctx.engine.update_settings(
        ctx.target,
        &SettingsUpdate {
            read_only: Some(true),
            ..Default::default()
        },
    )?;
    Ok(StepOutcome::Complete)
}

fn set_priority(ctx: &StepContext<'_>) -> HandlerResult {
    let StepKind::SetPriority { priority } = ctx.kind else {
        return Err(Fault::Step(mismatch(ctx)));
    };
    ctx.engine.update_settings(
        ctx.target,
        &SettingsUpdate {
            priority: Some(*priority),
            ..Default::default()
        },
    )?;
    Ok(StepOutcome::Complete)
}

fn create_snapshot(ctx: &StepContext<'_>) -> HandlerResult {
    let StepKind::CreateSnapshot {
        policy,
        repository,
        snapshot,
        indices,
        ignore_unavailable,
        include_global_state,
    } = ctx.kind
    else {
        return Err(Fault::Step(mismatch(ctx)));
    };
    if !ignore_unavailable {
        for index in indices.iter().filter(|i| !i.contains('*')) {
            if !ctx.engine.index_exists(index)? {
                return Err(EngineError::NotFound(index.clone()).into());
            }
        }
    }
    if let Ok(existing) = ctx.repository.snapshot_status(repository, snapshot) {
        // A retried execution that already took the snapshot.
        if existing.policy.as_deref() == Some(policy.as_str()) {
            return Ok(StepOutcome::Complete);
        }
    }
    let info = ctx.repository.create_snapshot(&SnapshotRequest {
        repository: repository.clone(),
        snapshot: snapshot.clone(),
        policy: Some(policy.clone()),
        indices: indices.clone(),
        ignore_unavailable: *ignore_unavailable,
        include_global_state: *include_global_state,
    })?;
    if info.state == SnapshotState::Failed {
        return Err(Fault::Step(StepError::new(
            ErrorKind::NonRetryableExecutionError,
            format!("snapshot [{repository}:{snapshot}] failed"),
        )));
    }
    Ok(StepOutcome::Complete)
}

fn delete_snapshot(ctx: &StepContext<'_>) -> HandlerResult {
    let StepKind::DeleteSnapshot {
        repository,
        snapshot,
    } = ctx.kind
    else {
        return Err(Fault::Step(mismatch(ctx)));
    };
    ctx.repository.delete_snapshot(repository, snapshot)?;
    Ok(StepOutcome::Complete)
}

fn mismatch(ctx: &StepContext<'_>) -> StepError {
    StepError::new(
        ErrorKind::NonRetryableExecutionError,
        format!("handler mismatch for step [{}]", ctx.kind),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryEngine, SnapshotRef};
    use crate::oracle::{RoleDescriptor, RoleOracle};
    use crate::policy::RolloverConditions;
    use crate::repository::{MemoryRepository, SnapshotInfo};

    struct Harness {
        oracle: Arc<RoleOracle>,
        engine: Arc<MemoryEngine>,
        repository: Arc<MemoryRepository>,
        executor: StepExecutor,
    }

    fn harness() -> Harness {
        let oracle = Arc::new(RoleOracle::new());
        oracle.put_role(
            "ilm",
            RoleDescriptor::cluster(&["monitor", "manage_ilm", "manage_slm", "create_snapshot"])
                .with_index(&["*"], &["all"]),
        );
        oracle.put_user("test_ilm", &["ilm"]);
        let engine = Arc::new(MemoryEngine::new());
        let repository = Arc::new(MemoryRepository::new());
        let executor = StepExecutor::new(oracle.clone(), engine.clone(), repository.clone());
        Harness {
            oracle,
            engine,
            repository,
            executor,
        }
    }

    const DELETE: StepKind = StepKind::DeleteIndex {
        delete_searchable_snapshot: true,
    };

    fn user() -> Identity {
        Identity::new("test_ilm")
    }

    fn run(h: &Harness, target: &str, kind: &StepKind) -> StepOutcome {
        h.executor
            .execute(target, kind, &user(), &Unfenced, Utc::now())
    }

    fn rollover_index(h: &Harness) {
        let settings = IndexSettings::with_policy("foo-policy").rollover_alias("foo_alias");
        h.engine
            .create_index_with_alias("foo-logs-000001", &settings, "foo_alias", true)
            .unwrap();
    }

    #[test]
    fn rollover_target_increments_and_pads() {
        assert_eq!(rollover_target("foo-logs-000001").as_deref(), Some("foo-logs-000002"));
        assert_eq!(rollover_target("logs-9").as_deref(), Some("logs-000010"));
        assert_eq!(rollover_target("nodigits"), None);
    }

    #[test]
    fn check_rollover_waits_then_completes() {
        let h = harness();
        rollover_index(&h);
        let kind = StepKind::CheckRolloverReady {
            conditions: RolloverConditions {
                max_docs: Some(2),
                ..Default::default()
            },
        };
        assert!(matches!(run(&h, "foo-logs-000001", &kind), StepOutcome::Waiting { .. }));
        for n in 0..2 {
            h.engine
                .index_document("foo_alias", serde_json::json!({ "n": n }))
                .unwrap();
        }
        assert_eq!(run(&h, "foo-logs-000001", &kind), StepOutcome::Complete);
    }

    #[test]
    fn attempt_rollover_is_idempotent() {
        let h = harness();
        rollover_index(&h);
        assert_eq!(
            run(&h, "foo-logs-000001", &StepKind::AttemptRollover),
            StepOutcome::Complete
        );
        assert_eq!(
            run(&h, "foo-logs-000001", &StepKind::AttemptRollover),
            StepOutcome::Complete
        );
        let members = h.engine.alias_targets("foo_alias").unwrap();
        assert_eq!(members.len(), 2);
        assert!(members
            .iter()
            .any(|m| m.index == "foo-logs-000002" && m.is_write_index));
        assert_eq!(
            h.engine
                .index_settings("foo-logs-000002")
                .unwrap()
                .lifecycle_name
                .as_deref(),
            Some("foo-policy")
        );
    }

    #[test]
    fn rollover_without_alias_is_not_retryable() {
        let h = harness();
        h.engine
            .create_index("logs-000001", &IndexSettings::with_policy("p"))
            .unwrap();
        match run(&h, "logs-000001", &StepKind::AttemptRollover) {
            StepOutcome::Failed(err) => {
                assert_eq!(err.kind, ErrorKind::NonRetryableExecutionError);
                assert!(err.reason.contains("rollover_alias"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn alias_not_pointing_at_index_is_precondition_failure() {
        let h = harness();
        rollover_index(&h);
        h.engine
            .create_index(
                "other-000001",
                &IndexSettings::with_policy("p").rollover_alias("foo_alias"),
            )
            .unwrap();
        match run(&h, "other-000001", &StepKind::AttemptRollover) {
            StepOutcome::Failed(err) => {
                assert_eq!(err.kind, ErrorKind::StepPreconditionFailed);
                assert!(err.is_retryable());
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn delete_of_missing_index_succeeds() {
        let h = harness();
        assert_eq!(run(&h, "ghost", &DELETE), StepOutcome::Removed);
    }

    #[test]
    fn delete_removes_the_backing_snapshot_only_when_asked() {
        let h = harness();
        h.repository.add_repository("cold");
        for name in ["mounted-1", "mounted-2"] {
            h.repository.insert_snapshot(SnapshotInfo {
                name: format!("snap-{name}"),
                repository: "cold".to_string(),
                policy: None,
                state: SnapshotState::Success,
                start_time: Utc::now(),
                indices: vec![name.to_string()],
            });
            let settings = IndexSettings {
                searchable_snapshot: Some(SnapshotRef {
                    repository: "cold".to_string(),
                    snapshot: format!("snap-{name}"),
                }),
                ..Default::default()
            };
            h.engine.create_index(name, &settings).unwrap();
        }

        assert_eq!(run(&h, "mounted-1", &DELETE), StepOutcome::Removed);
        assert!(!h.engine.index_exists("mounted-1").unwrap());
        assert!(h.repository.snapshot_status("cold", "snap-mounted-1").is_err());

        let keep = StepKind::DeleteIndex {
            delete_searchable_snapshot: false,
        };
        assert_eq!(run(&h, "mounted-2", &keep), StepOutcome::Removed);
        assert!(!h.engine.index_exists("mounted-2").unwrap());
        assert!(h.repository.snapshot_status("cold", "snap-mounted-2").is_ok());
    }

    #[test]
    fn missing_index_elsewhere_is_unavailable() {
        let h = harness();
        match run(&h, "ghost", &StepKind::ReadOnly) {
            StepOutcome::Failed(err) => assert_eq!(err.kind, ErrorKind::ResourceUnavailable),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn denial_carries_the_oracle_reason() {
        let h = harness();
        h.oracle.put_role(
            "limited",
            RoleDescriptor::cluster(&["monitor"]).with_index(&["not-ilm"], &["delete_index"]),
        );
        h.oracle.put_user("limited_user", &["limited"]);
        h.engine.create_index("not-ilm", &IndexSettings::default()).unwrap();
        let outcome = h.executor.execute(
            "not-ilm",
            &StepKind::WaitForShardHistoryLeases,
            &Identity::new("limited_user"),
            &Unfenced,
            Utc::now(),
        );
        match outcome {
            StepOutcome::Failed(err) => {
                assert_eq!(err.kind, ErrorKind::PermissionDenied);
                assert_eq!(err.action.as_deref(), Some("indices:monitor/stats"));
                assert_eq!(err.identity.as_deref(), Some("limited_user"));
                assert_eq!(err.resource.as_deref(), Some("not-ilm"));
                assert!(err.reason.contains("is unauthorized for user [limited_user]"));
            }
            other => panic!("expected denial, got {other:?}"),
        }
        assert!(h.engine.index_exists("not-ilm").unwrap());
    }

    #[test]
    fn stale_fence_skips_the_side_effect() {
        let h = harness();
        h.engine.create_index("a", &IndexSettings::default()).unwrap();
        let fence = || false;
        let outcome = h
            .executor
            .execute("a", &DELETE, &user(), &fence, Utc::now());
        match outcome {
            StepOutcome::Failed(err) => assert_eq!(err.kind, ErrorKind::Superseded),
            other => panic!("expected superseded, got {other:?}"),
        }
        assert!(h.engine.index_exists("a").unwrap());
    }

    #[test]
    fn unavailable_engine_is_retryable() {
        let h = harness();
        h.engine.create_index("a", &IndexSettings::default()).unwrap();
        h.engine.set_unavailable(true);
        match run(&h, "a", &StepKind::SetPriority { priority: 50 }) {
            StepOutcome::Failed(err) => {
                assert_eq!(err.kind, ErrorKind::ResourceUnavailable);
                assert!(err.is_retryable());
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_create_and_delete() {
        let h = harness();
        h.repository.add_repository("repo");
        let create = StepKind::CreateSnapshot {
            policy: "nightly".into(),
            repository: "repo".into(),
            snapshot: "snap-1".into(),
            indices: vec!["*".into()],
            ignore_unavailable: false,
            include_global_state: true,
        };
        assert_eq!(run(&h, "nightly", &create), StepOutcome::Complete);
        assert_eq!(run(&h, "nightly", &create), StepOutcome::Complete);
        let delete = StepKind::DeleteSnapshot {
            repository: "repo".into(),
            snapshot: "snap-1".into(),
        };
        assert_eq!(run(&h, "nightly", &delete), StepOutcome::Complete);
        assert_eq!(run(&h, "nightly", &delete), StepOutcome::Complete);
    }

    #[test]
    fn snapshot_of_missing_concrete_index_is_unavailable() {
        let h = harness();
        h.repository.add_repository("repo");
        let create = StepKind::CreateSnapshot {
            policy: "nightly".into(),
            repository: "repo".into(),
            snapshot: "snap-1".into(),
            indices: vec!["missing".into()],
            ignore_unavailable: false,
            include_global_state: false,
        };
        match run(&h, "nightly", &create) {
            StepOutcome::Failed(err) => assert_eq!(err.kind, ErrorKind::ResourceUnavailable),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
