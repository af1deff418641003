use crate::error::{LifecycleError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const LIFECYCLE_DIR: &str = ".lifecycle";
pub const CONFIG_FILE: &str = ".lifecycle/config.yaml";
pub const STORE_FILE: &str = ".lifecycle/state.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn lifecycle_dir(root: &Path) -> PathBuf {
    root.join(LIFECYCLE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn store_path(root: &Path) -> PathBuf {
    root.join(STORE_FILE)
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").unwrap())
}

/// Validate a policy or snapshot policy name. Returns the reason on failure.
pub fn validate_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name.len() > 255 {
        return Err("name must be at most 255 bytes".to_string());
    }
    if !name_re().is_match(name) {
        return Err(format!(
            "name '{name}' must start with a letter or digit and contain only letters, digits, '_', '.' or '-'"
        ));
    }
    Ok(())
}

/// Fail with `NotInitialized` unless `root` holds a `.lifecycle/` directory.
pub fn ensure_initialized(root: &Path) -> Result<()> {
    if !lifecycle_dir(root).is_dir() {
        return Err(LifecycleError::NotInitialized);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn valid_names() {
        for name in ["deletePolicy", "foo-policy", "nightly_snapshots", "a", "v1.2"] {
            validate_name(name).unwrap_or_else(|e| panic!("expected valid: {name}: {e}"));
        }
    }

    #[test]
    fn invalid_names() {
        for name in ["", "-dash", "_underscore", "has space", "slash/name"] {
            assert!(validate_name(name).is_err(), "expected invalid: {name}");
        }
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/cluster");
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/cluster/.lifecycle/config.yaml")
        );
        assert_eq!(
            store_path(root),
            PathBuf::from("/tmp/cluster/.lifecycle/state.redb")
        );
    }

    #[test]
    fn uninitialized_root_is_reported() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ensure_initialized(dir.path()),
            Err(LifecycleError::NotInitialized)
        ));
        std::fs::create_dir_all(lifecycle_dir(dir.path())).unwrap();
        ensure_initialized(dir.path()).unwrap();
    }
}
