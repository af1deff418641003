//! Retention selection: which snapshots of a policy may be deleted.
//!
//! Selection is a pure function of the retention settings, the snapshot list
//! and the clock, so running it again over the survivors selects nothing.

use crate::repository::{SnapshotInfo, SnapshotState};
use crate::types::TimeValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<TimeValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<usize>,
}

impl RetentionConfig {
    pub fn is_empty(&self) -> bool {
        self.expire_after.is_none() && self.min_count.is_none() && self.max_count.is_none()
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.min_count == Some(0) {
            return Err("retention min_count must be at least 1".to_string());
        }
        if self.max_count == Some(0) {
            return Err("retention max_count must be at least 1".to_string());
        }
        if let (Some(min), Some(max)) = (self.min_count, self.max_count) {
            if min > max {
                return Err(format!(
                    "retention min_count ({min}) must not exceed max_count ({max})"
                ));
            }
        }
        Ok(())
    }
}

/// Snapshots to delete, oldest first.
///
/// In-progress snapshots are never candidates. Deleting never takes the
/// count of completed snapshots below `min_count`; above `max_count` the
/// oldest go regardless of age; otherwise a snapshot goes once its age
/// reaches `expire_after`.
pub fn select_for_deletion(
    retention: &RetentionConfig,
    snapshots: &[SnapshotInfo],
    now: DateTime<Utc>,
) -> Vec<SnapshotInfo> {
    let mut candidates: Vec<&SnapshotInfo> = snapshots
        .iter()
        .filter(|s| s.state != SnapshotState::InProgress)
        .collect();
    candidates.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.name.cmp(&b.name)));

    let mut remaining = candidates.len();
    let mut selected = Vec::new();
    for snapshot in candidates {
        if retention.min_count.is_some_and(|min| remaining <= min) {
            break;
        }
        let over_max = retention.max_count.is_some_and(|max| remaining > max);
        let expired = retention
            .expire_after
            .is_some_and(|age| now - snapshot.start_time >= age.to_chrono());
        if over_max || expired {
            selected.push(snapshot.clone());
            remaining -= 1;
        }
    }
    selected
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
