//! Mapping an opened directory to the repository commands should run in.
//!
//! Generated projects often live one level below the directory the user
//! opened, so the directory itself is not always the right repository.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

/// Directories never searched for a nested repository.
const SKIPPED_DIRS: &[&str] = &[
    "node_modules",
    "bower_components",
    "vendor",
    "target",
    "dist",
    "build",
    "__pycache__",
];

/// Bidirectional cache of resolved repository roots.
#[derive(Debug, Default)]
pub struct RepoRootResolver {
    cache: Mutex<HashMap<PathBuf, PathBuf>>,
}

impl RepoRootResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `path` to the canonical root commands should run against.
    ///
    /// 1. `path` is a repository with a remote: `path`.
    /// 2. Exactly one immediate, non-hidden subdirectory is a repository with
    ///    a remote: that subdirectory.
    /// 3. `path` is a repository without a remote: `path`.
    /// 4. Otherwise `path` unchanged; the caller may initialise one there.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let key = absolute(path);
        if let Some(root) = self.lock().get(&key) {
            return root.clone();
        }

        let root = discover_root(&key);
        debug!(path = %key.display(), root = %root.display(), "resolved repository root");

        let mut cache = self.lock();
        cache.insert(key, root.clone());
        cache.insert(root.clone(), root.clone());
        root
    }

    /// Drop every cache entry that mentions `path`, as input or as root.
    pub fn invalidate(&self, path: &Path) {
        let key = absolute(path);
        self.lock()
            .retain(|input, root| *input != key && *root != key);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn cached(&self, path: &Path) -> Option<PathBuf> {
        self.lock().get(&absolute(path)).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, PathBuf>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn discover_root(path: &Path) -> PathBuf {
    if is_repo(path) && has_remote(path) {
        return path.to_path_buf();
    }

    let mut nested = nested_repos_with_remote(path);
    if nested.len() == 1 {
        if let Some(root) = nested.pop() {
            return root;
        }
    }

    path.to_path_buf()
}

fn nested_repos_with_remote(path: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(path) else {
        return Vec::new();
    };

    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            !name.starts_with('.') && !SKIPPED_DIRS.contains(&name.as_ref())
        })
        .map(|entry| entry.path())
        .filter(|dir| is_repo(dir) && has_remote(dir))
        .collect();
    found.sort();
    found
}

/// A directory is a repository root if it holds a `.git` directory, or a
/// `.git` file pointing at one.
pub fn is_repo(path: &Path) -> bool {
    git_dir(path).is_some()
}

/// Whether the repository at `path` has at least one `[remote "..."]`
/// section in its config.
pub fn has_remote(path: &Path) -> bool {
    let Some(dir) = git_dir(path) else {
        return false;
    };
    let config = common_dir(&dir).join("config");
    std::fs::read_to_string(config)
        .map(|text| config_declares_remote(&text))
        .unwrap_or(false)
}

fn git_dir(path: &Path) -> Option<PathBuf> {
    let dot_git = path.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git);
    }
    if dot_git.is_file() {
        let text = std::fs::read_to_string(&dot_git).ok()?;
        let target = text.lines().find_map(|l| l.strip_prefix("gitdir:"))?.trim();
        let target = Path::new(target);
        let resolved = if target.is_absolute() {
            target.to_path_buf()
        } else {
            path.join(target)
        };
        return resolved.is_dir().then_some(resolved);
    }
    None
}

/// Linked worktrees keep their config in the main repository's git dir.
fn common_dir(git_dir: &Path) -> PathBuf {
    match std::fs::read_to_string(git_dir.join("commondir")) {
        Ok(text) => {
            let rel = Path::new(text.trim());
            if rel.is_absolute() {
                rel.to_path_buf()
            } else {
                git_dir.join(rel)
            }
        }
        Err(_) => git_dir.to_path_buf(),
    }
}

fn config_declares_remote(config: &str) -> bool {
    config.lines().any(|line| {
        let line = line.trim();
        line.starts_with("[remote ") && line.ends_with(']')
    })
}

pub(crate) fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}
