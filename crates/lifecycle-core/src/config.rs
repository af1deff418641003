use crate::error::Result;
use crate::paths;
use crate::slm::schedule::CronSchedule;
use crate::types::TimeValue;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Failures of one step after which automatic retry stops. `None` retries
    /// forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Zero disables backoff: errored steps are retried on every tick.
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial: TimeValue,
    #[serde(default = "default_backoff_max")]
    pub backoff_max: TimeValue,
}

fn default_backoff_initial() -> TimeValue {
    TimeValue::ZERO
}

fn default_backoff_max() -> TimeValue {
    TimeValue::from_mins(5)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_initial: default_backoff_initial(),
            backoff_max: default_backoff_max(),
        }
    }
}

impl RetryConfig {
    /// Whether another automatic attempt is allowed after `failures`.
    pub fn allows_retry(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }

    /// Delay before re-attempting a step that has failed `failures` times:
    /// `initial * 2^(failures-1)`, capped at `backoff_max`.
    pub fn backoff(&self, failures: u32) -> TimeValue {
        if self.backoff_initial.is_zero() || failures == 0 {
            return TimeValue::ZERO;
        }
        let shift = (failures - 1).min(32);
        let millis = self
            .backoff_initial
            .as_millis()
            .saturating_mul(1u64 << shift);
        TimeValue::from_millis(millis.min(self.backoff_max.as_millis()))
    }
}

// ---------------------------------------------------------------------------
// SlmConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlmConfig {
    #[serde(default = "default_retention_schedule")]
    pub retention_schedule: String,
    #[serde(default = "default_retention_max_duration")]
    pub retention_max_duration: TimeValue,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_retention_schedule() -> String {
    "0 30 1 * * ?".to_string()
}

fn default_retention_max_duration() -> TimeValue {
    TimeValue::from_hours(1)
}

fn default_history_limit() -> usize {
    50
}

impl Default for SlmConfig {
    fn default() -> Self {
        Self {
            retention_schedule: default_retention_schedule(),
            retention_max_duration: default_retention_max_duration(),
            history_limit: default_history_limit(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: TimeValue,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_step_timeout")]
    pub step_timeout: TimeValue,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub slm: SlmConfig,
}

fn default_poll_interval() -> TimeValue {
    TimeValue::from_mins(10)
}

fn default_workers() -> usize {
    4
}

fn default_step_timeout() -> TimeValue {
    TimeValue::from_secs(30)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            workers: default_workers(),
            step_timeout: default_step_timeout(),
            retry: RetryConfig::default(),
            slm: SlmConfig::default(),
        }
    }
}

impl Config {
    /// Load `.lifecycle/config.yaml`; a missing file yields the defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut push = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message })
        };

        if self.workers == 0 {
            push(WarnLevel::Error, "workers must be at least 1".to_string());
        }
        if self.poll_interval.is_zero() {
            push(WarnLevel::Error, "poll_interval must be positive".to_string());
        }
        if self.step_timeout.is_zero() {
            push(WarnLevel::Error, "step_timeout must be positive".to_string());
        }
        if self.step_timeout > self.poll_interval {
            push(
                WarnLevel::Warning,
                format!(
                    "step_timeout ({}) exceeds poll_interval ({}); slow steps will overlap ticks",
                    self.step_timeout, self.poll_interval
                ),
            );
        }
        if self.retry.max_attempts == Some(0) {
            push(
                WarnLevel::Warning,
                "retry.max_attempts is 0; failed steps are never retried automatically"
                    .to_string(),
            );
        }
        if !self.retry.backoff_initial.is_zero()
            && self.retry.backoff_max < self.retry.backoff_initial
        {
            push(
                WarnLevel::Warning,
                format!(
                    "retry.backoff_max ({}) is below retry.backoff_initial ({})",
                    self.retry.backoff_max, self.retry.backoff_initial
                ),
            );
        }
        if let Err(e) = CronSchedule::parse(&self.slm.retention_schedule) {
            push(WarnLevel::Error, format!("slm.retention_schedule: {e}"));
        }
        if self.slm.history_limit == 0 {
            push(
                WarnLevel::Warning,
                "slm.history_limit is 0; invocation history is not kept".to_string(),
            );
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
