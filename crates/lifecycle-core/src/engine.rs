//! Storage / index engine collaborator.
//!
//! The engine is external; the orchestrator only needs the mutation
//! primitives below, each returning success or one of not-found / busy /
//! unavailable / failed. `MemoryEngine` is an in-process implementation for
//! tests and embedders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("no such resource [{0}]")]
    NotFound(String),
    #[error("resource [{0}] is busy")]
    Busy(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Failed(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Index types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub docs: u64,
    pub primary_size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Name of the lifecycle policy the index is associated with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollover_alias: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default)]
    pub indexing_complete: bool,
    /// Snapshot the index is mounted from, for searchable-snapshot indices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub searchable_snapshot: Option<SnapshotRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub repository: String,
    pub snapshot: String,
}

impl IndexSettings {
    pub fn with_policy(policy: impl Into<String>) -> Self {
        Self {
            lifecycle_name: Some(policy.into()),
            ..Default::default()
        }
    }

    pub fn rollover_alias(mut self, alias: impl Into<String>) -> Self {
        self.rollover_alias = Some(alias.into());
        self
    }
}

/// Partial settings change; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    pub read_only: Option<bool>,
    pub priority: Option<i64>,
    pub indexing_complete: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasTarget {
    pub index: String,
    pub is_write_index: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub settings: IndexSettings,
}

// ---------------------------------------------------------------------------
// IndexEngine
// ---------------------------------------------------------------------------

pub trait IndexEngine: Send + Sync {
    fn list_indices(&self) -> EngineResult<Vec<IndexInfo>>;
    fn index_exists(&self, index: &str) -> EngineResult<bool>;
    fn index_stats(&self, index: &str) -> EngineResult<IndexStats>;
    fn index_settings(&self, index: &str) -> EngineResult<IndexSettings>;
    fn update_settings(&self, index: &str, update: &SettingsUpdate) -> EngineResult<()>;
    fn create_index(&self, index: &str, settings: &IndexSettings) -> EngineResult<()>;
    fn delete_index(&self, index: &str) -> EngineResult<()>;
    /// Indices behind `alias`; empty when the alias does not exist.
    fn alias_targets(&self, alias: &str) -> EngineResult<Vec<AliasTarget>>;
    /// Atomically make `to` the write index of `alias`, keeping `from` as a
    /// read-only member.
    fn swap_write_alias(&self, alias: &str, from: &str, to: &str) -> EngineResult<()>;
}

// ---------------------------------------------------------------------------
// MemoryEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct IndexRecord {
    settings: IndexSettings,
    docs: Vec<serde_json::Value>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Cluster {
    indices: BTreeMap<String, IndexRecord>,
    aliases: BTreeMap<String, Vec<AliasTarget>>,
    unavailable: bool,
}

/// In-memory index engine.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    cluster: Mutex<Cluster>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_cluster<T>(&self, f: impl FnOnce(&mut Cluster) -> EngineResult<T>) -> EngineResult<T> {
        let mut cluster = self.cluster.lock().unwrap_or_else(|e| e.into_inner());
        if cluster.unavailable {
            return Err(EngineError::Unavailable("cluster is not reachable".to_string()));
        }
        f(&mut cluster)
    }

    /// Simulate the backend becoming unreachable (or reachable again).
    pub fn set_unavailable(&self, unavailable: bool) {
        let mut cluster = self.cluster.lock().unwrap_or_else(|e| e.into_inner());
        cluster.unavailable = unavailable;
    }

    /// Create an index and add it to `alias`.
    pub fn create_index_with_alias(
        &self,
        index: &str,
        settings: &IndexSettings,
        alias: &str,
        is_write_index: bool,
    ) -> EngineResult<()> {
        self.create_index(index, settings)?;
        self.with_cluster(|c| {
            c.aliases
                .entry(alias.to_string())
                .or_default()
                .push(AliasTarget {
                    index: index.to_string(),
                    is_write_index,
                });
            Ok(())
        })
    }

    /// Index a document into `target`, which may be an index or an alias. An
    /// alias resolves to its write index, or to its only member.
    pub fn index_document(&self, target: &str, doc: serde_json::Value) -> EngineResult<String> {
        self.with_cluster(|c| {
            let index = match c.aliases.get(target) {
                Some(members) => members
                    .iter()
                    .find(|m| m.is_write_index)
                    .or_else(|| if members.len() == 1 { members.first() } else { None })
                    .map(|m| m.index.clone())
                    .ok_or_else(|| {
                        EngineError::Failed(format!("alias [{target}] has no write index"))
                    })?,
                None => target.to_string(),
            };
            let record = c
                .indices
                .get_mut(&index)
                .ok_or_else(|| EngineError::NotFound(index.clone()))?;
            if record.settings.read_only {
                return Err(EngineError::Failed(format!(
                    "index [{index}] blocked by: [FORBIDDEN/8/index write (api)]"
                )));
            }
            record.docs.push(doc);
            Ok(index)
        })
    }

    pub fn doc_count(&self, index: &str) -> EngineResult<u64> {
        self.index_stats(index).map(|s| s.docs)
    }

    /// Backdate an index's creation time, for age-based conditions.
    pub fn set_created_at(&self, index: &str, created_at: DateTime<Utc>) -> EngineResult<()> {
        self.with_cluster(|c| {
            let record = c
                .indices
                .get_mut(index)
                .ok_or_else(|| EngineError::NotFound(index.to_string()))?;
            record.created_at = created_at;
            Ok(())
        })
    }
}

impl IndexEngine for MemoryEngine {
    fn list_indices(&self) -> EngineResult<Vec<IndexInfo>> {
        self.with_cluster(|c| {
            Ok(c.indices
                .iter()
                .map(|(name, record)| IndexInfo {
                    name: name.clone(),
                    settings: record.settings.clone(),
                })
                .collect())
        })
    }

    fn index_exists(&self, index: &str) -> EngineResult<bool> {
        self.with_cluster(|c| Ok(c.indices.contains_key(index)))
    }

    fn index_stats(&self, index: &str) -> EngineResult<IndexStats> {
        self.with_cluster(|c| {
            let record = c
                .indices
                .get(index)
                .ok_or_else(|| EngineError::NotFound(index.to_string()))?;
            let size = record.docs.iter().map(|d| d.to_string().len() as u64).sum();
            Ok(IndexStats {
                docs: record.docs.len() as u64,
                primary_size_bytes: size,
                created_at: record.created_at,
            })
        })
    }

    fn index_settings(&self, index: &str) -> EngineResult<IndexSettings> {
        self.with_cluster(|c| {
            c.indices
                .get(index)
                .map(|r| r.settings.clone())
                .ok_or_else(|| EngineError::NotFound(index.to_string()))
        })
    }

    fn update_settings(&self, index: &str, update: &SettingsUpdate) -> EngineResult<()> {
        self.with_cluster(|c| {
            let record = c
                .indices
                .get_mut(index)
                .ok_or_else(|| EngineError::NotFound(index.to_string()))?;
            if let Some(read_only) = update.read_only {
                record.settings.read_only = read_only;
            }
            if let Some(priority) = update.priority {
                record.settings.priority = Some(priority);
            }
            if let Some(done) = update.indexing_complete {
                record.settings.indexing_complete = done;
            }
            Ok(())
        })
    }

    fn create_index(&self, index: &str, settings: &IndexSettings) -> EngineResult<()> {
        self.with_cluster(|c| {
            if c.indices.contains_key(index) {
                return Err(EngineError::Failed(format!(
                    "index [{index}] already exists"
                )));
            }
            c.indices.insert(
                index.to_string(),
                IndexRecord {
                    settings: settings.clone(),
                    docs: Vec::new(),
                    created_at: Utc::now(),
                },
            );
            Ok(())
        })
    }

    fn delete_index(&self, index: &str) -> EngineResult<()> {
        self.with_cluster(|c| {
            if c.indices.remove(index).is_none() {
                return Err(EngineError::NotFound(index.to_string()));
            }
            for members in c.aliases.values_mut() {
                members.retain(|m| m.index != index);
            }
            c.aliases.retain(|_, members| !members.is_empty());
            Ok(())
        })
    }

    fn alias_targets(&self, alias: &str) -> EngineResult<Vec<AliasTarget>> {
        self.with_cluster(|c| Ok(c.aliases.get(alias).cloned().unwrap_or_default()))
    }

    fn swap_write_alias(&self, alias: &str, from: &str, to: &str) -> EngineResult<()> {
        self.with_cluster(|c| {
            if !c.indices.contains_key(to) {
                return Err(EngineError::NotFound(to.to_string()));
            }
            let members = c
                .aliases
                .get_mut(alias)
                .ok_or_else(|| EngineError::NotFound(alias.to_string()))?;
            for member in members.iter_mut() {
                if member.index == from {
                    member.is_write_index = false;
                }
            }
            match members.iter_mut().find(|m| m.index == to) {
                Some(member) => member.is_write_index = true,
                None => members.push(AliasTarget {
                    index: to.to_string(),
                    is_write_index: true,
                }),
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
