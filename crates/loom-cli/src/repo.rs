use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;

use loom_core::config::LoomConfig;
use loom_core::diagnostics::DescriptorDiagnostics;
use loom_core::repo::{GitExecError, GitOperation, RepoRootResolver, RepoService};
use loom_core::spawn_gate::SpawnGate;

#[derive(Debug, Subcommand)]
pub enum RepoCommand {
    /// Working tree status.
    Status,
    /// Recent commits.
    Log {
        #[arg(long, default_value_t = 20)]
        max_count: u32,
    },
    /// Unstaged (or staged) changes.
    Diff {
        #[arg(long)]
        staged: bool,
        paths: Vec<String>,
    },
    /// Commit staged changes.
    Commit {
        #[arg(short, long)]
        message: String,
        /// Stage modified tracked files first.
        #[arg(long)]
        all: bool,
    },
    Push {
        remote: Option<String>,
        branch: Option<String>,
        #[arg(long)]
        set_upstream: bool,
    },
    Pull {
        remote: Option<String>,
        branch: Option<String>,
    },
    Fetch {
        remote: Option<String>,
    },
    /// Local branches.
    Branches,
    /// Arbitrary git arguments.
    Raw {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
}

impl From<RepoCommand> for GitOperation {
    fn from(cmd: RepoCommand) -> Self {
        match cmd {
            RepoCommand::Status => GitOperation::Status,
            RepoCommand::Log { max_count } => GitOperation::Log { max_count },
            RepoCommand::Diff { staged, paths } => GitOperation::Diff { staged, paths },
            RepoCommand::Commit { message, all } => GitOperation::Commit { message, all },
            RepoCommand::Push {
                remote,
                branch,
                set_upstream,
            } => GitOperation::Push {
                remote,
                branch,
                set_upstream,
            },
            RepoCommand::Pull { remote, branch } => GitOperation::Pull { remote, branch },
            RepoCommand::Fetch { remote } => GitOperation::Fetch { remote },
            RepoCommand::Branches => GitOperation::Branches,
            RepoCommand::Raw { args } => GitOperation::Raw { args },
        }
    }
}

pub async fn run_repo(
    config: &LoomConfig,
    path: &Path,
    cmd: RepoCommand,
    json: bool,
) -> Result<ExitCode> {
    let service = RepoService::new(
        config.repo.clone(),
        Arc::new(RepoRootResolver::new()),
        Arc::new(SpawnGate::new(std::time::Duration::from_millis(
            config.repo.spawn_gate_ms,
        ))),
        Arc::new(DescriptorDiagnostics::from_config(&config.diagnostics)),
    );

    let op = GitOperation::from(cmd);
    let result = service.run(path, op).await;
    service.cleanup_all();

    match result {
        Ok(output) => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&output).context("failed to serialize output")?
                );
            } else {
                print!("{}", output.stdout);
                eprint!("{}", output.stderr);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(GitExecError::NonZeroExit {
            code,
            stdout,
            stderr,
            ..
        }) => {
            print!("{stdout}");
            eprint!("{stderr}");
            let code = code.and_then(|c| u8::try_from(c).ok()).unwrap_or(1);
            Ok(ExitCode::from(code))
        }
        Err(e) => Err(e).context("git operation failed"),
    }
}
