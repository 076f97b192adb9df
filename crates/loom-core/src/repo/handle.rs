use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::exec::{GitCommandOutput, GitExecError, GitInvocation};
use crate::config::RepoConfig;

/// A version-control request, as issued by the UI or the assistant bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GitOperation {
    Status,
    Log {
        #[serde(default = "default_log_count")]
        max_count: u32,
    },
    Diff {
        #[serde(default)]
        staged: bool,
        #[serde(default)]
        paths: Vec<String>,
    },
    Add {
        paths: Vec<String>,
    },
    Commit {
        message: String,
        #[serde(default)]
        all: bool,
    },
    Push {
        #[serde(default)]
        remote: Option<String>,
        #[serde(default)]
        branch: Option<String>,
        #[serde(default)]
        set_upstream: bool,
    },
    Pull {
        #[serde(default)]
        remote: Option<String>,
        #[serde(default)]
        branch: Option<String>,
    },
    Fetch {
        #[serde(default)]
        remote: Option<String>,
    },
    Checkout {
        branch: String,
        #[serde(default)]
        create: bool,
    },
    Branches,
    CurrentBranch,
    Init,
    /// Escape hatch for features without a dedicated descriptor.
    Raw {
        args: Vec<String>,
    },
}

fn default_log_count() -> u32 {
    50
}

impl GitOperation {
    /// Command-line arguments, without the program name.
    pub fn to_args(&self) -> Vec<String> {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match self {
            GitOperation::Status => owned(&["status", "--porcelain=v1", "--branch"]),
            GitOperation::Log { max_count } => {
                let mut args = owned(&["log", "--pretty=format:%H%x1f%an%x1f%aI%x1f%s"]);
                args.push(format!("--max-count={max_count}"));
                args
            }
            GitOperation::Diff { staged, paths } => {
                let mut args = owned(&["diff"]);
                if *staged {
                    args.push("--cached".to_string());
                }
                if !paths.is_empty() {
                    args.push("--".to_string());
                    args.extend(paths.iter().cloned());
                }
                args
            }
            GitOperation::Add { paths } => {
                let mut args = owned(&["add", "--"]);
                if paths.is_empty() {
                    args.push(".".to_string());
                } else {
                    args.extend(paths.iter().cloned());
                }
                args
            }
            GitOperation::Commit { message, all } => {
                let mut args = owned(&["commit"]);
                if *all {
                    args.push("--all".to_string());
                }
                args.push("-m".to_string());
                args.push(message.clone());
                args
            }
            GitOperation::Push {
                remote,
                branch,
                set_upstream,
            } => {
                let mut args = owned(&["push"]);
                if *set_upstream {
                    args.push("--set-upstream".to_string());
                }
                args.extend(remote.iter().cloned());
                args.extend(branch.iter().cloned());
                args
            }
            GitOperation::Pull { remote, branch } => {
                let mut args = owned(&["pull", "--ff-only"]);
                args.extend(remote.iter().cloned());
                args.extend(branch.iter().cloned());
                args
            }
            GitOperation::Fetch { remote } => {
                let mut args = owned(&["fetch", "--prune"]);
                match remote {
                    Some(remote) => args.push(remote.clone()),
                    None => args.push("--all".to_string()),
                }
                args
            }
            GitOperation::Checkout { branch, create } => {
                let mut args = owned(&["checkout"]);
                if *create {
                    args.push("-b".to_string());
                }
                args.push(branch.clone());
                args
            }
            GitOperation::Branches => owned(&["branch", "--list", "--format=%(refname:short)"]),
            GitOperation::CurrentBranch => owned(&["rev-parse", "--abbrev-ref", "HEAD"]),
            GitOperation::Init => owned(&["init"]),
            GitOperation::Raw { args } => args.clone(),
        }
    }

    /// Short name used in logs and diagnostics.
    pub fn label(&self) -> String {
        match self.to_args().first() {
            Some(sub) => format!("git {sub}"),
            None => "git".to_string(),
        }
    }
}

/// Long-lived command executor bound to one repository root.
#[derive(Debug, Clone)]
pub struct GitRepository {
    root: PathBuf,
    program: String,
    timeout: Duration,
}

impl GitRepository {
    pub fn new(root: PathBuf, program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            root,
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(root: PathBuf, cfg: &RepoConfig) -> Self {
        Self::new(
            root,
            cfg.git_program.clone(),
            Duration::from_secs(cfg.command_timeout_secs),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn execute(&self, op: &GitOperation) -> Result<GitCommandOutput, GitExecError> {
        GitInvocation::new(self.program.as_str(), op.to_args(), self.root.as_path())
            .timeout(self.timeout)
            .run()
            .await
    }
}

/// One cached [`GitRepository`] per canonical root.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: Mutex<HashMap<PathBuf, Arc<GitRepository>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<F>(&self, root: &Path, create: F) -> Arc<GitRepository>
    where
        F: FnOnce() -> GitRepository,
    {
        self.lock()
            .entry(root.to_path_buf())
            .or_insert_with(|| Arc::new(create()))
            .clone()
    }

    pub fn remove(&self, root: &Path) -> Option<Arc<GitRepository>> {
        self.lock().remove(root)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<GitRepository>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_args_keep_message_as_one_argument() {
        let op = GitOperation::Commit {
            message: "fix: handle spaces in message".to_string(),
            all: true,
        };
        assert_eq!(
            op.to_args(),
            vec!["commit", "--all", "-m", "fix: handle spaces in message"]
        );
    }

    #[test]
    fn fetch_without_remote_fetches_all() {
        let op = GitOperation::Fetch { remote: None };
        assert_eq!(op.to_args(), vec!["fetch", "--prune", "--all"]);
    }

    #[test]
    fn descriptors_deserialize_from_tagged_json() {
        let op: GitOperation =
            serde_json::from_str(r#"{"op":"log","max_count":5}"#).unwrap();
        assert_eq!(op, GitOperation::Log { max_count: 5 });

        let op: GitOperation = serde_json::from_str(r#"{"op":"log"}"#).unwrap();
        assert_eq!(op, GitOperation::Log { max_count: 50 });

        let op: GitOperation =
            serde_json::from_str(r#"{"op":"push","set_upstream":true,"remote":"origin"}"#)
                .unwrap();
        assert_eq!(op.to_args(), vec!["push", "--set-upstream", "origin"]);
    }

    #[test]
    fn labels_name_the_subcommand() {
        assert_eq!(GitOperation::Status.label(), "git status");
        assert_eq!(
            GitOperation::Raw {
                args: vec!["stash".into(), "list".into()]
            }
            .label(),
            "git stash"
        );
    }

    #[test]
    fn registry_reuses_handles_per_root() {
        let registry = HandleRegistry::new();
        let root = PathBuf::from("/tmp/loom-handle-test");
        let first = registry.get_or_create(&root, || {
            GitRepository::new(root.clone(), "git", Duration::from_secs(1))
        });
        let second = registry.get_or_create(&root, || panic!("handle must be reused"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        registry.remove(&root);
        assert!(registry.is_empty());
    }
}
