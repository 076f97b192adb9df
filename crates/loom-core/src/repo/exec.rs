use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

pub const DEFAULT_GIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Captured result of a finished git command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitCommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Error)]
pub enum GitExecError {
    #[error("`{command}` did not finish within {timeout_secs}s")]
    TimedOut { command: String, timeout_secs: u64 },

    #[error("`{command}` exited with {code:?}: {stderr}")]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("could not run git: {0}")]
    Io(#[from] std::io::Error),
}

/// One git process: program, arguments, working directory and deadline.
#[derive(Debug, Clone)]
pub struct GitInvocation {
    program: String,
    args: Vec<String>,
    cwd: PathBuf,
    timeout: Duration,
}

impl GitInvocation {
    pub fn new<I, S>(program: impl Into<String>, args: I, cwd: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
            timeout: DEFAULT_GIT_COMMAND_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Rendered command line, used in errors and logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs to completion or kills the process at the deadline.
    ///
    /// Stdin is closed and `GIT_TERMINAL_PROMPT=0` is set, so a credential
    /// prompt fails fast instead of holding the repository's lane open.
    pub async fn run(&self) -> Result<GitCommandOutput, GitExecError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the pending future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                tracing::warn!(command = %self.display(), "git command timed out");
                return Err(GitExecError::TimedOut {
                    command: self.display(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code();

        if output.status.success() {
            Ok(GitCommandOutput {
                stdout,
                stderr,
                exit_code,
            })
        } else {
            Err(GitExecError::NonZeroExit {
                command: self.display(),
                code: exit_code,
                stdout,
                stderr,
            })
        }
    }
}

/// `git args..` in `cwd` with the default deadline.
pub async fn run_git(args: &[&str], cwd: &Path) -> Result<GitCommandOutput, GitExecError> {
    GitInvocation::new("git", args.iter().copied(), cwd).run().await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::fault::is_transient_descriptor_fault;

    fn sh(script: &str, cwd: &Path) -> GitInvocation {
        GitInvocation::new("sh", ["-c", script], cwd).timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn success_captures_both_streams() {
        let tmp = tempfile::tempdir().unwrap();
        let out = sh("echo on branch main; echo hint >&2", tmp.path())
            .run()
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "on branch main");
        assert_eq!(out.stderr.trim(), "hint");
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn nonzero_exit_keeps_stderr_visible_to_the_classifier() {
        let tmp = tempfile::tempdir().unwrap();
        let err = sh("echo 'fatal: Bad file descriptor' >&2; exit 128", tmp.path())
            .run()
            .await
            .unwrap_err();

        match &err {
            GitExecError::NonZeroExit { code, stderr, command, .. } => {
                assert_eq!(*code, Some(128));
                assert!(stderr.contains("Bad file descriptor"));
                assert!(command.starts_with("sh -c"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(is_transient_descriptor_fault(&err));
    }

    #[tokio::test]
    async fn deadline_kills_the_process() {
        let tmp = tempfile::tempdir().unwrap();
        let err = sh("sleep 5", tmp.path())
            .timeout(Duration::from_millis(50))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, GitExecError::TimedOut { timeout_secs: 0, .. }));
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = GitInvocation::new("loom-no-such-git", ["status"], tmp.path())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, GitExecError::Io(_)));
    }

    #[test]
    fn display_joins_program_and_args() {
        let inv = GitInvocation::new("git", ["log", "-n", "5"], "/tmp");
        assert_eq!(inv.display(), "git log -n 5");
    }
}
