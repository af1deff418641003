use lifecycle_core::paths;
use std::path::{Path, PathBuf};

/// Resolve the lifecycle root directory.
///
/// `--root` / `LIFECYCLE_ROOT` wins. Otherwise walk upward from the
/// working directory to the nearest `.lifecycle/`, falling back to the
/// working directory itself so `init` has somewhere to go.
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_upward(&cwd).unwrap_or(cwd)
}

fn find_upward(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(paths::LIFECYCLE_DIR).is_dir())
        .map(Path::to_path_buf)
}
