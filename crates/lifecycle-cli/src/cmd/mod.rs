pub mod config;
pub mod index;
pub mod init;
pub mod mode;
pub mod policy;
pub mod slm;

use anyhow::Context;
use lifecycle_core::oracle::Identity;
use lifecycle_core::store::{self, RedbStore};
use std::path::Path;

/// Open the store under `root`, failing with a hint when `init` never ran.
pub(crate) fn open_store(root: &Path) -> anyhow::Result<RedbStore> {
    store::open(root).with_context(|| format!("cannot open lifecycle store in {}", root.display()))
}

pub(crate) fn require_identity(identity: Option<&str>, what: &str) -> anyhow::Result<Identity> {
    match identity {
        Some(principal) if !principal.trim().is_empty() => Ok(Identity::new(principal.trim())),
        _ => anyhow::bail!("{what} needs an execution identity: pass --identity or set LIFECYCLE_IDENTITY"),
    }
}

/// Read a YAML document describing a policy.
pub(crate) fn read_yaml<T: serde::de::DeserializeOwned>(file: &Path) -> anyhow::Result<T> {
    let data = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    serde_yaml::from_str(&data).with_context(|| format!("failed to parse {}", file.display()))
}
