use lifecycle_core::engine::EngineError;
use lifecycle_core::step::StepError;
use lifecycle_core::LifecycleError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("step failed: {0}")]
    Step(#[from] StepError),

    #[error("a retention pass is already running")]
    RetentionRunning,

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type DaemonResult<T> = std::result::Result<T, DaemonError>;
