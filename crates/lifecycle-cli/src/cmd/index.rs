//! Per-index operations: bind, unbind, explain, retry and move.

use crate::cmd::open_store;
use crate::output::{or_dash, print_json, print_table};
use anyhow::Context;
use chrono::Utc;
use lifecycle_core::{admin, oracle::Identity, state::Explain, types::StepKey};
use std::path::Path;

pub fn bind(
    root: &Path,
    index: &str,
    policy: &str,
    identity: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let state = admin::bind(&store, index, policy, identity.map(Identity::new), Utc::now())
        .with_context(|| format!("failed to bind '{index}' to '{policy}'"))?;
    if json {
        print_json(&state)
    } else {
        println!(
            "Bound '{index}' to policy '{}' as {}",
            state.policy, state.identity
        );
        Ok(())
    }
}

pub fn unbind(root: &Path, index: &str) -> anyhow::Result<()> {
    let store = open_store(root)?;
    admin::unbind(&store, index)?;
    println!("Unbound '{index}'");
    Ok(())
}

pub fn explain(root: &Path, index: Option<&str>, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let explains = match index {
        Some(index) => vec![admin::explain(&store, index)?],
        None => admin::explain_all(&store)?,
    };

    if json {
        return match index {
            Some(_) => print_json(&explains[0]),
            None => print_json(&explains),
        };
    }
    if explains.is_empty() {
        println!("No managed indices.");
        return Ok(());
    }
    if let [single] = explains.as_slice() {
        print_detail(single);
        return Ok(());
    }
    let rows = explains
        .iter()
        .map(|e| {
            vec![
                e.index.clone(),
                or_dash(e.policy.as_ref()),
                or_dash(e.phase.as_ref()),
                or_dash(e.action.as_ref()),
                or_dash(e.step.as_ref()),
                or_dash(e.status),
                or_dash(e.failed_step_retry_count),
            ]
        })
        .collect();
    print_table(
        &["INDEX", "POLICY", "PHASE", "ACTION", "STEP", "STATUS", "RETRIES"],
        rows,
    );
    Ok(())
}

fn print_detail(e: &Explain) {
    println!("index:   {}", e.index);
    println!("managed: {}", e.managed);
    if !e.managed {
        return;
    }
    println!("policy:  {}", or_dash(e.policy.as_ref()));
    println!("phase:   {}", or_dash(e.phase.as_ref()));
    println!("action:  {}", or_dash(e.action.as_ref()));
    println!("step:    {}", or_dash(e.step.as_ref()));
    println!("status:  {}", or_dash(e.status));
    if let Some(failed) = &e.failed_step {
        println!("failed step: {failed}");
        println!("retries:     {}", or_dash(e.failed_step_retry_count));
        println!("auto retry:  {}", or_dash(e.is_auto_retryable_error));
        println!("error since: {}", or_dash(e.error_since));
    }
    if let Some(info) = &e.step_info {
        println!("step info:   {info}");
    }
}

pub fn retry(root: &Path, index: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let state = admin::retry(&store, index)?;
    if json {
        print_json(&state)
    } else {
        println!(
            "Retry requested for '{index}' at {} (failures so far: {})",
            state.step, state.retry_count
        );
        Ok(())
    }
}

pub fn move_to(
    root: &Path,
    index: &str,
    to: &str,
    from: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let target: StepKey = to.parse()?;
    let expected = from.map(str::parse::<StepKey>).transpose()?;
    let store = open_store(root)?;
    let state = admin::move_to_step(&store, index, expected.as_ref(), target)?;
    if json {
        print_json(&state)
    } else {
        println!("Moved '{index}' to {}", state.step);
        Ok(())
    }
}
