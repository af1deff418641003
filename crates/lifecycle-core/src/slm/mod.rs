//! Snapshot lifecycle domain: policies, cron schedules and retention.
//!
//! The scheduling loop that drives these lives in the daemon.

pub mod policy;
pub mod retention;
pub mod schedule;

pub use policy::{
    HistoryEntry, HistoryOperation, Invocation, SnapshotConfig, SnapshotPolicy,
    SnapshotPolicyMetadata, SnapshotPolicyRecord, SnapshotStats,
};
pub use retention::{select_for_deletion, RetentionConfig};
pub use schedule::{is_due, next_fire, CronSchedule};
