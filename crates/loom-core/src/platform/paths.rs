//! Search-path augmentation for spawned toolchains.
//!
//! A GUI app launched from the dock inherits a minimal `PATH` that usually
//! lacks Homebrew, version managers and per-user install locations.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Fixed system locations, checked in order.
const SYSTEM_DIRS: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin"];

/// Locations relative to the user's home directory.
const HOME_DIRS: &[&str] = &[
    ".bun/bin",
    ".volta/bin",
    ".cargo/bin",
    ".local/bin",
    ".deno/bin",
    ".npm-global/bin",
    "Library/pnpm",
];

/// Candidate toolchain directories for `home`, newest nvm node first.
pub fn toolchain_dirs(home: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();

    if let Some(home) = home {
        if let Some(node) = newest_nvm_node(home) {
            dirs.push(node);
        }
        dirs.extend(HOME_DIRS.iter().map(|rel| home.join(rel)));
    }
    dirs.extend(SYSTEM_DIRS.iter().map(PathBuf::from));
    dirs
}

/// Build a `PATH` value: the inherited entries first, then every existing
/// toolchain directory and `extra` entry that is not already present.
pub fn augmented_path(inherited: Option<OsString>, extra: &[String]) -> OsString {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut entries: Vec<PathBuf> = inherited
        .as_deref()
        .map(|p| std::env::split_paths(p).collect())
        .unwrap_or_default();

    let candidates = toolchain_dirs(home.as_deref())
        .into_iter()
        .chain(extra.iter().map(PathBuf::from));
    for dir in candidates {
        if dir.is_dir() && !entries.contains(&dir) {
            entries.push(dir);
        }
    }

    std::env::join_paths(entries).unwrap_or_else(|_| inherited.unwrap_or_default())
}

/// `~/.nvm/versions/node/<highest>/bin`, if nvm is installed.
fn newest_nvm_node(home: &Path) -> Option<PathBuf> {
    let versions = home.join(".nvm").join("versions").join("node");
    let mut found: Vec<(Vec<u64>, PathBuf)> = std::fs::read_dir(versions)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let version = parse_version(&name)?;
            Some((version, entry.path().join("bin")))
        })
        .collect();
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found.pop().map(|(_, bin)| bin)
}

fn parse_version(name: &str) -> Option<Vec<u64>> {
    name.trim_start_matches('v')
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect()
}
