use kship_core::config::CONFIG_FILE;
use std::path::{Path, PathBuf};

/// Resolve the project root.
///
/// Priority:
/// 1. `--root` flag / `KSHIP_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `kship.yaml`
/// 3. Walk upward from `cwd` looking for `.git/`
/// 4. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    discover_root(&cwd)
}

fn discover_root(start: &Path) -> PathBuf {
    find_upward(start, |dir| dir.join(CONFIG_FILE).is_file())
        .or_else(|| find_upward(start, |dir| dir.join(".git").is_dir()))
        .unwrap_or_else(|| start.to_path_buf())
}

fn find_upward(start: &Path, found: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    start.ancestors().find(|dir| found(dir)).map(Path::to_path_buf)
}
