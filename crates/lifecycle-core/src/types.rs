use crate::error::LifecycleError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// TimeValue
// ---------------------------------------------------------------------------

/// A non-negative duration written with a unit suffix (`500ms`, `1s`, `10m`,
/// `12h`, `30d`). A bare `0` is accepted as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimeValue {
    millis: u64,
}

impl TimeValue {
    pub const ZERO: TimeValue = TimeValue { millis: 0 };

    pub fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::from_millis(secs.saturating_mul(1_000))
    }

    pub fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins.saturating_mul(60))
    }

    pub fn from_hours(hours: u64) -> Self {
        Self::from_mins(hours.saturating_mul(60))
    }

    pub fn from_days(days: u64) -> Self {
        Self::from_hours(days.saturating_mul(24))
    }

    pub fn as_millis(self) -> u64 {
        self.millis
    }

    pub fn is_zero(self) -> bool {
        self.millis == 0
    }

    pub fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_millis(self.millis)
    }

    pub fn to_chrono(self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.millis).unwrap_or(i64::MAX))
    }
}

const UNITS: &[(&str, u64)] = &[
    ("d", 86_400_000),
    ("h", 3_600_000),
    ("m", 60_000),
    ("s", 1_000),
    ("ms", 1),
];

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis == 0 {
            return f.write_str("0s");
        }
        for (suffix, factor) in UNITS {
            if self.millis % factor == 0 {
                return write!(f, "{}{}", self.millis / factor, suffix);
            }
        }
        write!(f, "{}ms", self.millis)
    }
}

impl FromStr for TimeValue {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "0" {
            return Ok(TimeValue::ZERO);
        }
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| LifecycleError::InvalidTimeValue(s.to_string()))?;
        let (digits, suffix) = s.split_at(split);
        if digits.is_empty() {
            return Err(LifecycleError::InvalidTimeValue(s.to_string()));
        }
        let amount: u64 = digits
            .parse()
            .map_err(|_| LifecycleError::InvalidTimeValue(s.to_string()))?;
        let factor = match suffix {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => return Err(LifecycleError::InvalidTimeValue(s.to_string())),
        };
        Ok(TimeValue::from_millis(amount.saturating_mul(factor)))
    }
}

impl Serialize for TimeValue {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TimeValue {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Per-resource execution status.
///
/// Transitions: `Pending → Executing → Pending | Error | Completed`, and
/// `Error → Executing` on automatic or manual retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Executing,
    Error,
    Completed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OperationMode
// ---------------------------------------------------------------------------

/// Whether a lifecycle loop is allowed to do work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    #[default]
    Running,
    Stopping,
    Stopped,
}

impl OperationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationMode::Running => "running",
            OperationMode::Stopping => "stopping",
            OperationMode::Stopped => "stopped",
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, OperationMode::Running)
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepKey
// ---------------------------------------------------------------------------

pub const NEW_PHASE: &str = "new";
pub const COMPLETE: &str = "complete";
pub const COMPLETED: &str = "completed";

/// Structural pointer into a policy: (phase, action, step).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepKey {
    pub phase: String,
    pub action: String,
    pub name: String,
}

impl StepKey {
    pub fn new(
        phase: impl Into<String>,
        action: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            phase: phase.into(),
            action: action.into(),
            name: name.into(),
        }
    }

    /// Pointer of a freshly bound resource, before its first phase.
    pub fn initial() -> Self {
        Self::new(NEW_PHASE, COMPLETE, COMPLETE)
    }

    /// Pointer once every action of `phase` has completed.
    pub fn phase_complete(phase: &str) -> Self {
        Self::new(phase, COMPLETE, COMPLETE)
    }

    /// Pointer of a resource that has exhausted its policy.
    pub fn terminal() -> Self {
        Self::new(COMPLETED, COMPLETED, COMPLETED)
    }

    /// True for the `new` and phase-complete pointers, which wait on a phase gate.
    pub fn is_phase_boundary(&self) -> bool {
        self.action == COMPLETE && self.name == COMPLETE
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == COMPLETED
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.phase, self.action, self.name)
    }
}

/// Parses the `phase/action/step` form produced by `Display`.
impl FromStr for StepKey {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        match parts.as_slice() {
            [phase, action, name] if parts.iter().all(|p| !p.is_empty()) => {
                Ok(StepKey::new(*phase, *action, *name))
            }
            _ => Err(LifecycleError::InvalidStepKey(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_value_parses_units() {
        assert_eq!("0".parse::<TimeValue>().unwrap(), TimeValue::ZERO);
        assert_eq!("0s".parse::<TimeValue>().unwrap(), TimeValue::ZERO);
        assert_eq!("500ms".parse::<TimeValue>().unwrap().as_millis(), 500);
        assert_eq!("10m".parse::<TimeValue>().unwrap(), TimeValue::from_mins(10));
        assert_eq!("30d".parse::<TimeValue>().unwrap(), TimeValue::from_days(30));
    }

    #[test]
    fn time_value_rejects_garbage() {
        assert!("".parse::<TimeValue>().is_err());
        assert!("10".parse::<TimeValue>().is_err());
        assert!("ten minutes".parse::<TimeValue>().is_err());
        assert!("5w".parse::<TimeValue>().is_err());
    }

    #[test]
    fn time_value_displays_largest_exact_unit() {
        assert_eq!(TimeValue::from_secs(120).to_string(), "2m");
        assert_eq!(TimeValue::from_secs(90).to_string(), "90s");
        assert_eq!(TimeValue::from_millis(1500).to_string(), "1500ms");
        assert_eq!(TimeValue::ZERO.to_string(), "0s");
    }

    #[test]
    fn time_value_serde_as_string() {
        let json = serde_json::to_string(&TimeValue::from_hours(12)).unwrap();
        assert_eq!(json, "\"12h\"");
        let back: TimeValue = serde_json::from_str("\"1d\"").unwrap();
        assert_eq!(back, TimeValue::from_days(1));
    }

    #[test]
    fn step_key_sentinels() {
        assert!(StepKey::initial().is_phase_boundary());
        assert!(StepKey::phase_complete("hot").is_phase_boundary());
        assert!(StepKey::terminal().is_terminal());
        assert!(!StepKey::new("hot", "rollover", "attempt-rollover").is_phase_boundary());
        assert_eq!(
            StepKey::new("delete", "delete", "delete").to_string(),
            "delete/delete/delete"
        );
    }

    #[test]
    fn step_key_parses_display_form() {
        let key: StepKey = "hot/rollover/check-rollover-ready".parse().unwrap();
        assert_eq!(key, StepKey::new("hot", "rollover", "check-rollover-ready"));
        assert!("hot/rollover".parse::<StepKey>().is_err());
        assert!("hot//x".parse::<StepKey>().is_err());
    }
}
