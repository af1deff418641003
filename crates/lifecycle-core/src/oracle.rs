//! Permission oracle: the allow / deny decision consumed before every side
//! effect.
//!
//! The authorization subsystem itself is an external collaborator, so the
//! orchestrator only depends on the `PermissionOracle` trait. `RoleOracle` is
//! an in-process implementation with role descriptors and named privileges,
//! used by tests and embedders. Its denial messages follow the
//! `action [..] is unauthorized for user [..]` format operators already know.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

// ---------------------------------------------------------------------------
// Identity / Resource
// ---------------------------------------------------------------------------

/// The principal whose privileges gate a step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub principal: String,
}

impl Identity {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.principal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum Resource {
    Cluster,
    Index(String),
}

impl Resource {
    pub fn index(name: impl Into<String>) -> Self {
        Resource::Index(name.into())
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Cluster => f.write_str("cluster"),
            Resource::Index(name) => f.write_str(name),
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    /// Machine-readable reason, surfaced to operators verbatim.
    pub reason: String,
    /// Privileges that would have allowed the action.
    pub required_privileges: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

pub trait PermissionOracle: Send + Sync {
    fn authorize(&self, identity: &Identity, action: &str, resource: &Resource) -> Decision;
}

// ---------------------------------------------------------------------------
// Named privileges
// ---------------------------------------------------------------------------

// Order matters: it is the order privileges are listed in denial messages.
const INDEX_PRIVILEGES: &[(&str, &[&str])] = &[
    ("read", &["indices:data/read/*"]),
    ("write", &["indices:data/write/*"]),
    ("monitor", &["indices:monitor/*"]),
    (
        "view_index_metadata",
        &[
            "indices:admin/get",
            "indices:admin/aliases/get",
            "indices:admin/ilm/explain",
        ],
    ),
    ("delete_index", &["indices:admin/delete"]),
    ("manage_ilm", &["indices:admin/ilm/*"]),
    ("manage", &["indices:monitor/*", "indices:admin/*"]),
    ("all", &["indices:*"]),
];

const CLUSTER_PRIVILEGES: &[(&str, &[&str])] = &[
    ("monitor", &["cluster:monitor/*"]),
    (
        "read_ilm",
        &["cluster:admin/ilm/get", "cluster:admin/ilm/operation_mode/get"],
    ),
    (
        "read_slm",
        &[
            "cluster:admin/slm/get",
            "cluster:admin/slm/stats",
            "cluster:admin/slm/status",
        ],
    ),
    (
        "monitor_snapshot",
        &["cluster:admin/snapshot/get", "cluster:admin/snapshot/status"],
    ),
    (
        "create_snapshot",
        &[
            "cluster:admin/snapshot/create",
            "cluster:admin/snapshot/get",
            "cluster:admin/snapshot/status",
        ],
    ),
    ("manage_ilm", &["cluster:admin/ilm/*"]),
    ("manage_slm", &["cluster:admin/slm/*"]),
    ("manage", &["cluster:*"]),
    ("all", &["cluster:*"]),
];

/// Glob match where `*` matches any run of characters.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return text.is_empty();
    };
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };
    let mut parts: Vec<&str> = parts.collect();
    // No `*` at all: the whole text must be the literal.
    let Some(last) = parts.pop() else {
        return rest.is_empty();
    };
    for part in parts {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// Action patterns granted by `privilege`. Raw action patterns
/// (`cluster:admin/snapshot/*`) grant themselves.
fn patterns_for<'a>(table: &'a [(&'a str, &'a [&'a str])], privilege: &'a str) -> Vec<&'a str> {
    if privilege.contains(':') {
        return vec![privilege];
    }
    table
        .iter()
        .find(|(name, _)| *name == privilege)
        .map(|(_, patterns)| patterns.to_vec())
        .unwrap_or_default()
}

fn grants(table: &[(&str, &[&str])], privilege: &str, action: &str) -> bool {
    patterns_for(table, privilege)
        .iter()
        .any(|p| glob_match(p, action))
}

fn granting_privileges(table: &[(&str, &[&str])], action: &str) -> Vec<String> {
    table
        .iter()
        .filter(|(_, patterns)| patterns.iter().any(|p| glob_match(p, action)))
        .map(|(name, _)| name.to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// RoleOracle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexGrant {
    pub names: Vec<String>,
    pub privileges: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleDescriptor {
    #[serde(default)]
    pub cluster: Vec<String>,
    #[serde(default)]
    pub indices: Vec<IndexGrant>,
}

impl RoleDescriptor {
    pub fn cluster(privileges: &[&str]) -> Self {
        Self {
            cluster: privileges.iter().map(|p| p.to_string()).collect(),
            indices: Vec::new(),
        }
    }

    pub fn with_index(mut self, names: &[&str], privileges: &[&str]) -> Self {
        self.indices.push(IndexGrant {
            names: names.iter().map(|n| n.to_string()).collect(),
            privileges: privileges.iter().map(|p| p.to_string()).collect(),
        });
        self
    }
}

#[derive(Default)]
struct Realm {
    roles: HashMap<String, RoleDescriptor>,
    users: HashMap<String, Vec<String>>,
}

/// Role-based oracle. Users and roles can change at any time; every
/// `authorize` call sees the latest definitions.
#[derive(Default)]
pub struct RoleOracle {
    realm: RwLock<Realm>,
}

impl RoleOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_role(&self, name: impl Into<String>, descriptor: RoleDescriptor) {
        let mut realm = self.realm.write().unwrap_or_else(|e| e.into_inner());
        realm.roles.insert(name.into(), descriptor);
    }

    pub fn put_user(&self, name: impl Into<String>, roles: &[&str]) {
        let mut realm = self.realm.write().unwrap_or_else(|e| e.into_inner());
        realm
            .users
            .insert(name.into(), roles.iter().map(|r| r.to_string()).collect());
    }

    fn deny(&self, identity: &Identity, action: &str, resource: &Resource, roles: &[String]) -> Decision {
        let mut effective = roles.to_vec();
        effective.sort();
        let (scope, table) = match resource {
            Resource::Cluster => ("cluster", CLUSTER_PRIVILEGES),
            Resource::Index(_) => ("index", INDEX_PRIVILEGES),
        };
        let required = granting_privileges(table, action);

        let mut reason = format!(
            "action [{action}] is unauthorized for user [{}] with effective roles [{}]",
            identity.principal,
            effective.join(",")
        );
        if let Resource::Index(name) = resource {
            reason.push_str(&format!(" on indices [{name}]"));
        }
        if !required.is_empty() {
            reason.push_str(&format!(
                ", this action is granted by the {scope} privileges [{}]",
                required.join(",")
            ));
        }
        Decision::Deny(Denial {
            reason,
            required_privileges: required,
        })
    }
}

impl PermissionOracle for RoleOracle {
    fn authorize(&self, identity: &Identity, action: &str, resource: &Resource) -> Decision {
        let realm = self.realm.read().unwrap_or_else(|e| e.into_inner());
        let roles = realm
            .users
            .get(&identity.principal)
            .cloned()
            .unwrap_or_default();
        let descriptors: Vec<&RoleDescriptor> =
            roles.iter().filter_map(|r| realm.roles.get(r)).collect();

        let allowed = match resource {
            Resource::Cluster => descriptors.iter().any(|d| {
                d.cluster
                    .iter()
                    .any(|p| grants(CLUSTER_PRIVILEGES, p, action))
            }),
            Resource::Index(name) => descriptors.iter().any(|d| {
                d.indices.iter().any(|grant| {
                    grant.names.iter().any(|n| glob_match(n, name))
                        && grant
                            .privileges
                            .iter()
                            .any(|p| grants(INDEX_PRIVILEGES, p, action))
                })
            }),
        };

        if allowed {
            Decision::Allow
        } else {
            self.deny(identity, action, resource, &roles)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
