mod dev;
mod repo;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use loom_core::config::{load_config, LoomConfig};
use loom_core::diagnostics::DescriptorDiagnostics;
use loom_core::repo::RepoRootResolver;

#[derive(Parser)]
#[command(name = "loom", version, about = "Dev server supervision and serialized git access")]
struct Cli {
    /// Path to loom.toml config file.
    #[arg(long, global = true, default_value = "loom.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a project's dev server and stream its output until Ctrl-C.
    Dev {
        /// Project directory.
        path: PathBuf,
        /// Shell command to run instead of the detected one.
        #[arg(long)]
        command: Option<String>,
        /// Print events as JSON lines.
        #[arg(long)]
        json: bool,
        /// Forget recorded crashes before starting.
        #[arg(long)]
        clear_crashes: bool,
    },
    /// Run a git operation through the per-repository queue.
    Repo {
        /// Any directory inside or above the repository.
        path: PathBuf,
        #[command(subcommand)]
        op: repo::RepoCommand,
        /// Print the command output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the repository root a directory resolves to.
    Root {
        path: PathBuf,
    },
    /// Print one descriptor diagnostics report as JSON.
    Fds,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = load(&cli.config)?;

    match cli.command {
        Some(Command::Dev {
            path,
            command,
            json,
            clear_crashes,
        }) => dev::run_dev(&config, &path, command.as_deref(), json, clear_crashes).await,
        Some(Command::Repo { path, op, json }) => repo::run_repo(&config, &path, op, json).await,
        Some(Command::Root { path }) => {
            let resolver = RepoRootResolver::new();
            println!("{}", resolver.resolve(&path).display());
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Fds) => run_fds(&config),
        None => {
            println!("loom v{}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(json: bool) {
    if json {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        loom_core::init_tracing();
    }
}

fn load(path: &Path) -> Result<LoomConfig> {
    load_config(path).with_context(|| format!("failed to load config from {}", path.display()))
}

fn run_fds(config: &LoomConfig) -> Result<ExitCode> {
    let diagnostics = DescriptorDiagnostics::from_config(&config.diagnostics);
    let report = diagnostics
        .capture("cli", 0, 0)
        .context("diagnostics report was throttled")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to serialize report")?
    );
    Ok(ExitCode::SUCCESS)
}
