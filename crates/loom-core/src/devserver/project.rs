//! Project inspection: which command starts the dev server and which one
//! installs its dependencies.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

/// Scripts tried in order when no command is given.
const SCRIPT_PREFERENCE: &[&str] = &["dev", "start", "serve"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Pnpm,
    Yarn,
    Bun,
}

impl PackageManager {
    /// Infer from the lock file present in `project`; npm if none is.
    pub fn detect(project: &Path) -> Self {
        if project.join("bun.lockb").exists() || project.join("bun.lock").exists() {
            PackageManager::Bun
        } else if project.join("pnpm-lock.yaml").exists() {
            PackageManager::Pnpm
        } else if project.join("yarn.lock").exists() {
            PackageManager::Yarn
        } else {
            PackageManager::Npm
        }
    }

    pub fn program(self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
            PackageManager::Bun => "bun",
        }
    }

    pub fn install_command(self) -> String {
        format!("{} install", self.program())
    }

    pub fn run_script(self, script: &str) -> String {
        match self {
            PackageManager::Npm => format!("npm run {script}"),
            other => format!("{} {script}", other.program()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PackageManifest {
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

/// How to start and repair a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectCommands {
    /// Shell command that starts the dev server.
    pub start: String,
    /// Shell command that installs dependencies.
    pub install: String,
}

/// Work out the commands for `project`.
///
/// `explicit` wins over `configured`, which wins over detection from
/// `package.json`. Returns `None` when nothing can be determined.
pub fn resolve_commands(
    project: &Path,
    explicit: Option<&str>,
    configured: Option<&str>,
    install_override: Option<&str>,
) -> Option<ProjectCommands> {
    let manager = PackageManager::detect(project);
    let start = explicit
        .or(configured)
        .map(str::trim)
        .filter(|cmd| !cmd.is_empty())
        .map(str::to_string)
        .or_else(|| detect_start_script(project).map(|script| manager.run_script(&script)))?;

    let install = install_override
        .map(str::trim)
        .filter(|cmd| !cmd.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| manager.install_command());

    Some(ProjectCommands { start, install })
}

/// First of `dev`, `start`, `serve` declared in `package.json`.
pub fn detect_start_script(project: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(project.join("package.json")).ok()?;
    let manifest: PackageManifest = match serde_json::from_str(&raw) {
        Ok(manifest) => manifest,
        Err(e) => {
            tracing::debug!(project = %project.display(), error = %e, "unreadable package.json");
            return None;
        }
    };
    SCRIPT_PREFERENCE
        .iter()
        .find(|name| manifest.scripts.contains_key(**name))
        .map(|name| name.to_string())
}
