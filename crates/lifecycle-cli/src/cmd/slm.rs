use crate::cmd::{open_store, read_yaml, require_identity};
use crate::output::{or_dash, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use lifecycle_core::{
    admin,
    slm::{SnapshotPolicy, SnapshotPolicyRecord},
    store::LifecycleStore,
};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum SlmSubcommand {
    /// Store a snapshot policy from a YAML file
    Put {
        /// YAML file with `id`, `name`, `schedule`, `repository`
        file: PathBuf,
    },
    /// List snapshot policies with their last runs
    List,
    /// Show one snapshot policy with its metadata
    Show { id: String },
    /// Delete a snapshot policy
    Delete { id: String },
    /// Take a snapshot for the policy on the next tick
    Execute { id: String },
    /// Run retention on the next tick
    Retention,
    /// Snapshot and retention counters
    Stats,
}

pub fn run(
    root: &Path,
    subcmd: SlmSubcommand,
    identity: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    match subcmd {
        SlmSubcommand::Put { file } => put(root, &file, identity, json),
        SlmSubcommand::List => list(root, json),
        SlmSubcommand::Show { id } => show(root, &id, json),
        SlmSubcommand::Delete { id } => delete(root, &id),
        SlmSubcommand::Execute { id } => execute(root, &id, json),
        SlmSubcommand::Retention => retention(root),
        SlmSubcommand::Stats => stats(root, json),
    }
}

fn put(root: &Path, file: &Path, identity: Option<&str>, json: bool) -> anyhow::Result<()> {
    let caller = require_identity(identity, "slm put")?;
    let policy: SnapshotPolicy = read_yaml(file)?;
    let store = open_store(root)?;
    let record = admin::set_snapshot_policy(&store, &policy, &caller)
        .with_context(|| format!("failed to store snapshot policy '{}'", policy.id))?;
    if json {
        print_json(&record)
    } else {
        println!(
            "Stored snapshot policy '{}' (version {}, next run {})",
            record.policy.id,
            record.policy.version,
            next_run(&record)
        );
        Ok(())
    }
}

fn next_run(record: &SnapshotPolicyRecord) -> String {
    record
        .policy
        .cron()
        .ok()
        .and_then(|cron| cron.next_after(record.schedule_reference()))
        .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let records = store.list_snapshot_policies()?;
    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No snapshot policies.");
        return Ok(());
    }
    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.policy.id.clone(),
                r.policy.repository.clone(),
                r.policy.schedule.clone(),
                next_run(r),
                or_dash(r.metadata.last_success.as_ref().map(|i| &i.snapshot_name)),
                or_dash(r.metadata.last_failure.as_ref().map(|i| &i.snapshot_name)),
            ]
        })
        .collect();
    print_table(
        &["ID", "REPOSITORY", "SCHEDULE", "NEXT", "LAST SUCCESS", "LAST FAILURE"],
        rows,
    );
    Ok(())
}

fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let record = admin::get_snapshot_policy(&store, id)?;
    if json {
        print_json(&record)
    } else {
        print!("{}", serde_yaml::to_string(&record)?);
        Ok(())
    }
}

fn delete(root: &Path, id: &str) -> anyhow::Result<()> {
    let store = open_store(root)?;
    admin::delete_snapshot_policy(&store, id)?;
    println!("Deleted snapshot policy '{id}'");
    Ok(())
}

fn execute(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let record = admin::request_snapshot(&store, id)?;
    if json {
        print_json(&serde_json::json!({
            "policy": record.policy.id,
            "execute_requested": record.metadata.execute_requested,
        }))
    } else {
        println!("Snapshot requested for '{id}'; it runs on the next tick");
        Ok(())
    }
}

fn retention(root: &Path) -> anyhow::Result<()> {
    let store = open_store(root)?;
    admin::request_retention(&store)?;
    println!("Retention requested; it runs on the next tick");
    Ok(())
}

fn stats(root: &Path, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let report = admin::slm_stats(&store)?;
    if json {
        return print_json(&report);
    }
    let r = &report.retention;
    println!(
        "retention: {} runs, {} failed, {} timed out, {}ms deleting",
        r.retention_runs, r.retention_failed, r.retention_timed_out, r.retention_deletion_time_millis
    );
    let t = &report.totals;
    println!(
        "snapshots: {} taken, {} failed, {} deleted, {} deletion failures",
        t.snapshots_taken, t.snapshots_failed, t.snapshots_deleted, t.snapshot_deletion_failures
    );
    if !report.policy_stats.is_empty() {
        let rows = report
            .policy_stats
            .iter()
            .map(|p| {
                vec![
                    p.policy.clone(),
                    p.stats.snapshots_taken.to_string(),
                    p.stats.snapshots_failed.to_string(),
                    p.stats.snapshots_deleted.to_string(),
                    p.stats.snapshot_deletion_failures.to_string(),
                ]
            })
            .collect();
        println!();
        print_table(&["POLICY", "TAKEN", "FAILED", "DELETED", "DELETE FAILURES"], rows);
    }
    Ok(())
}
