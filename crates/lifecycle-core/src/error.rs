use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("not initialized: run 'lifecyclectl init'")]
    NotInitialized,

    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    #[error("snapshot policy not found: {0}")]
    SnapshotPolicyNotFound(String),

    #[error("index is not managed: {0}")]
    NotManaged(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("index '{index}' is already managed by policy '{policy}'")]
    AlreadyManaged { index: String, policy: String },

    #[error("invalid policy '{policy}': {reason}")]
    InvalidPolicy { policy: String, reason: String },

    #[error("invalid time value '{0}': expected a number followed by ms, s, m, h or d")]
    InvalidTimeValue(String),

    #[error("invalid schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("invalid step key '{0}': expected phase/action/step")]
    InvalidStepKey(String),

    #[error("invalid move for '{index}': {reason}")]
    InvalidMove { index: String, reason: String },

    #[error("cannot retry '{index}': {reason}")]
    InvalidRetry { index: String, reason: String },

    #[error("policy '{policy}' is in use by {count} managed indices")]
    PolicyInUse { policy: String, count: usize },

    #[error("concurrent modification of '{key}': expected version {expected}, found {found}")]
    VersionConflict {
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("{0}")]
    Forbidden(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
