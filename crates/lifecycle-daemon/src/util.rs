use lifecycle_core::oracle::{Decision, Identity, PermissionOracle, Resource};
use lifecycle_core::step::{ErrorKind, StepOutcome};
use lifecycle_core::types::TimeValue;
use lifecycle_core::LifecycleError;
use tokio::task::JoinHandle;

use crate::error::DaemonResult;

/// Run store and collaborator calls off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> DaemonResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> DaemonResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

/// Await a step running on a blocking thread for at most `timeout`.
///
/// The thread is not cancelled when the timeout fires; it runs to the end
/// and its outcome is dropped.
pub(crate) async fn bounded_step(
    task: JoinHandle<StepOutcome>,
    timeout: TimeValue,
    step: &str,
) -> StepOutcome {
    match tokio::time::timeout(timeout.to_std(), task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => StepOutcome::failed(
            ErrorKind::NonRetryableExecutionError,
            format!("step [{step}] aborted: {e}"),
        ),
        Err(_) => StepOutcome::failed(
            ErrorKind::Timeout,
            format!("step [{step}] did not finish within [{timeout}]"),
        ),
    }
}

/// Fail with `Forbidden` unless `caller` may perform `action` on `resource`.
pub(crate) fn require(
    oracle: &dyn PermissionOracle,
    caller: &Identity,
    action: &str,
    resource: &Resource,
) -> DaemonResult<()> {
    match oracle.authorize(caller, action, resource) {
        Decision::Allow => Ok(()),
        Decision::Deny(denial) => Err(LifecycleError::Forbidden(denial.reason).into()),
    }
}
