use crate::cmd::{open_store, read_yaml, require_identity};
use crate::output::{or_dash, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use lifecycle_core::{admin, policy::Policy, store::LifecycleStore};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum PolicySubcommand {
    /// Store a policy from a YAML file, replacing any earlier version
    Put {
        /// YAML file with `name` and `phases`
        file: PathBuf,
    },
    /// List stored policies
    List,
    /// Show one policy
    Show { name: String },
    /// Delete a policy no index is using
    Delete { name: String },
}

pub fn run(
    root: &Path,
    subcmd: PolicySubcommand,
    identity: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    match subcmd {
        PolicySubcommand::Put { file } => put(root, &file, identity, json),
        PolicySubcommand::List => list(root, json),
        PolicySubcommand::Show { name } => show(root, &name, json),
        PolicySubcommand::Delete { name } => delete(root, &name, json),
    }
}

fn put(root: &Path, file: &Path, identity: Option<&str>, json: bool) -> anyhow::Result<()> {
    let caller = require_identity(identity, "policy put")?;
    let policy: Policy = read_yaml(file)?;
    let store = open_store(root)?;
    let stored = admin::set_policy(&store, &policy, &caller)
        .with_context(|| format!("failed to store policy '{}'", policy.name))?;

    if json {
        print_json(&stored)?;
    } else {
        println!(
            "Stored policy '{}' (version {}, identity {caller})",
            stored.name, stored.version
        );
    }
    Ok(())
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let policies = store.list_policies()?;

    if json {
        return print_json(&policies);
    }
    if policies.is_empty() {
        println!("No policies.");
        return Ok(());
    }
    let rows = policies
        .iter()
        .map(|p| {
            vec![
                p.name.clone(),
                p.version.to_string(),
                p.phases
                    .iter()
                    .map(|ph| ph.name.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
                or_dash(p.identity.as_ref()),
                p.modified_date.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ]
        })
        .collect();
    print_table(&["NAME", "VERSION", "PHASES", "IDENTITY", "MODIFIED"], rows);
    Ok(())
}

fn show(root: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let policy = admin::get_policy(&store, name)?;
    if json {
        print_json(&policy)
    } else {
        print!("{}", serde_yaml::to_string(&policy)?);
        Ok(())
    }
}

fn delete(root: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    admin::delete_policy(&store, name)?;
    if json {
        print_json(&serde_json::json!({ "deleted": name }))
    } else {
        println!("Deleted policy '{name}'");
        Ok(())
    }
}
