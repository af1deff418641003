use crate::error::{LifecycleError, Result};
use crate::oracle::Identity;
use crate::paths;
use crate::slm::retention::RetentionConfig;
use crate::slm::schedule::CronSchedule;
use crate::step::StepKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// SnapshotConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_indices")]
    pub indices: Vec<String>,
    #[serde(default)]
    pub ignore_unavailable: bool,
    #[serde(default = "default_include_global_state")]
    pub include_global_state: bool,
}

fn default_indices() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_include_global_state() -> bool {
    true
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            indices: default_indices(),
            ignore_unavailable: false,
            include_global_state: default_include_global_state(),
        }
    }
}

// ---------------------------------------------------------------------------
// SnapshotPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    pub id: String,
    /// Prefix of generated snapshot names.
    pub name: String,
    pub schedule: String,
    pub repository: String,
    #[serde(default)]
    pub config: SnapshotConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(default)]
    pub version: u64,
    #[serde(default = "Utc::now")]
    pub modified_date: DateTime<Utc>,
}

impl SnapshotPolicy {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        schedule: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            schedule: schedule.into(),
            repository: repository.into(),
            config: SnapshotConfig::default(),
            retention: None,
            identity: None,
            version: 0,
            modified_date: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| LifecycleError::InvalidPolicy {
            policy: self.id.clone(),
            reason,
        };
        paths::validate_name(&self.id).map_err(invalid)?;
        if self.name.is_empty() {
            return Err(invalid("snapshot name prefix must not be empty".to_string()));
        }
        if self.name != self.name.to_lowercase() || self.name.contains(char::is_whitespace) {
            return Err(invalid(format!(
                "snapshot name prefix '{}' must be lowercase without whitespace",
                self.name
            )));
        }
        if self.repository.is_empty() {
            return Err(invalid("repository must not be empty".to_string()));
        }
        if self.config.indices.is_empty() {
            return Err(invalid("config.indices must not be empty".to_string()));
        }
        CronSchedule::parse(&self.schedule)?;
        if let Some(retention) = &self.retention {
            retention.validate().map_err(invalid)?;
        }
        Ok(())
    }

    pub fn cron(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&self.schedule)
    }

    /// `<prefix>-<yyyy.mm.dd>-<random suffix>`.
    pub fn generate_snapshot_name(&self, now: DateTime<Utc>) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", self.name, now.format("%Y.%m.%d"), &suffix[..12])
    }

    pub fn create_step(&self, snapshot: &str) -> StepKind {
        StepKind::CreateSnapshot {
            policy: self.id.clone(),
            repository: self.repository.clone(),
            snapshot: snapshot.to_string(),
            indices: self.config.indices.clone(),
            ignore_unavailable: self.config.ignore_unavailable,
            include_global_state: self.config.include_global_state,
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub snapshot_name: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub snapshots_taken: u64,
    pub snapshots_failed: u64,
    pub snapshots_deleted: u64,
    pub snapshot_deletion_failures: u64,
}

impl SnapshotStats {
    pub fn add(&mut self, other: &SnapshotStats) {
        self.snapshots_taken += other.snapshots_taken;
        self.snapshots_failed += other.snapshots_failed;
        self.snapshots_deleted += other.snapshots_deleted;
        self.snapshot_deletion_failures += other.snapshot_deletion_failures;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryOperation {
    Create,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub operation: HistoryOperation,
    pub snapshot_name: String,
    pub time: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPolicyMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<Invocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<Invocation>,
    #[serde(default)]
    pub stats: SnapshotStats,
    /// Newest last.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    /// A manual execution was requested and has not run yet.
    #[serde(default)]
    pub execute_requested: bool,
}

impl SnapshotPolicyMetadata {
    pub fn record(&mut self, entry: HistoryEntry, limit: usize) {
        let invocation = Invocation {
            snapshot_name: entry.snapshot_name.clone(),
            time: entry.time,
            details: entry.details.clone(),
        };
        match (entry.operation, entry.success) {
            (HistoryOperation::Create, true) => {
                self.stats.snapshots_taken += 1;
                self.last_success = Some(invocation);
            }
            (HistoryOperation::Create, false) => {
                self.stats.snapshots_failed += 1;
                self.last_failure = Some(invocation);
            }
            (HistoryOperation::Delete, true) => self.stats.snapshots_deleted += 1,
            (HistoryOperation::Delete, false) => self.stats.snapshot_deletion_failures += 1,
        }
        self.history.push(entry);
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }
}

/// A stored snapshot policy with its run metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPolicyRecord {
    pub policy: SnapshotPolicy,
    #[serde(default)]
    pub metadata: SnapshotPolicyMetadata,
    /// Bumped by the store on every conditional write.
    #[serde(default)]
    pub version: u64,
}

impl SnapshotPolicyRecord {
    pub fn new(policy: SnapshotPolicy) -> Self {
        Self {
            policy,
            metadata: SnapshotPolicyMetadata::default(),
            version: 0,
        }
    }

    /// Reference time for the schedule: last fire, else when the policy was
    /// stored.
    pub fn schedule_reference(&self) -> DateTime<Utc> {
        self.metadata
            .last_fired_at
            .unwrap_or(self.policy.modified_date)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeValue;
    use chrono::TimeZone;

    fn policy() -> SnapshotPolicy {
        let mut policy = SnapshotPolicy::new("test_slm", "snap", "1 2 3 * * ?", "my_snap");
        policy.retention = Some(RetentionConfig {
            expire_after: Some(TimeValue::ZERO),
            ..Default::default()
        });
        policy
    }

    #[test]
    fn valid_policy_passes() {
        policy().validate().unwrap();
    }

    #[test]
    fn bad_schedule_and_prefix_rejected() {
        let mut bad = policy();
        bad.schedule = "every day".to_string();
        assert!(matches!(
            bad.validate(),
            Err(LifecycleError::InvalidSchedule { .. })
        ));
        let mut bad = policy();
        bad.name = "Snap".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn snapshot_names_carry_prefix_and_date() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let name = policy().generate_snapshot_name(now);
        assert!(name.starts_with("snap-2024.03.10-"), "{name}");
        assert_ne!(name, policy().generate_snapshot_name(now));
    }

    #[test]
    fn history_is_bounded_and_stats_counted() {
        let mut meta = SnapshotPolicyMetadata::default();
        let now = Utc::now();
        for i in 0..5 {
            meta.record(
                HistoryEntry {
                    operation: HistoryOperation::Create,
                    snapshot_name: format!("snap-{i}"),
                    time: now,
                    success: i != 3,
                    details: None,
                },
                3,
            );
        }
        assert_eq!(meta.history.len(), 3);
        assert_eq!(meta.history[0].snapshot_name, "snap-2");
        assert_eq!(meta.stats.snapshots_taken, 4);
        assert_eq!(meta.stats.snapshots_failed, 1);
        assert_eq!(meta.last_failure.unwrap().snapshot_name, "snap-3");
        assert_eq!(meta.last_success.unwrap().snapshot_name, "snap-4");
    }

    #[test]
    fn policy_parses_from_yaml_with_defaults() {
        let yaml = r#"
id: nightly
name: nightly-snap
schedule: "0 30 1 * * ?"
repository: backups
retention:
  expire_after: 30d
  min_count: 5
  max_count: 50
"#;
        let policy: SnapshotPolicy = serde_yaml::from_str(yaml).unwrap();
        policy.validate().unwrap();
        assert_eq!(policy.config.indices, vec!["*"]);
        assert!(policy.config.include_global_state);
        assert_eq!(
            policy.retention.unwrap().expire_after,
            Some(TimeValue::from_days(30))
        );
    }
}
