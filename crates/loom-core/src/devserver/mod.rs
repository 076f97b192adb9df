//! Dev server supervision: one child process per project, started through a
//! bounded, self-repairing attempt loop.

pub mod classify;
pub mod crash;
pub mod launch;
pub mod port;
pub mod probe;
pub mod project;
mod supervisor;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::DevServerConfig;

pub use classify::ExitCause;
pub use crash::CrashHistory;
pub use supervisor::DevServerSupervisor;

#[derive(Debug, Error)]
pub enum DevServerError {
    #[error("a dev server is already running for this project")]
    AlreadyRunning,

    #[error("crashed {crashes} times in the last {window_secs}s; clear the crash history to retry")]
    CrashLoop { crashes: usize, window_secs: u64 },

    #[error("no start command configured and none found in package.json")]
    NoCommand,

    #[error("failed to spawn dev server: {0}")]
    Spawn(std::io::Error),

    #[error("dependency install failed: {detail}")]
    InstallFailed { detail: String },

    #[error("dev server exited with code {}: {detail}", code_label(.exit_code))]
    Crashed {
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("dev server did not start after {attempts} attempts: {detail}")]
    AttemptsExhausted { attempts: u32, detail: String },

    #[error("dev server was stopped before it became ready")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

/// Lifecycle stage reported in status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DevServerStage {
    Starting,
    Installing,
    Retrying,
    Ready,
    Error,
    KillingPort,
}

impl DevServerStage {
    pub fn as_str(self) -> &'static str {
        match self {
            DevServerStage::Starting => "starting",
            DevServerStage::Installing => "installing",
            DevServerStage::Retrying => "retrying",
            DevServerStage::Ready => "ready",
            DevServerStage::Error => "error",
            DevServerStage::KillingPort => "killing-port",
        }
    }
}

impl std::fmt::Display for DevServerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcast to every subscriber of a [`DevServerSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DevServerEvent {
    #[serde(rename_all = "camelCase")]
    Status {
        project_path: PathBuf,
        stage: DevServerStage,
        message: String,
        url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Output { project_path: PathBuf, text: String },
    #[serde(rename_all = "camelCase")]
    Exited {
        project_path: PathBuf,
        exit_code: Option<i32>,
    },
}

impl DevServerEvent {
    pub fn project_path(&self) -> &std::path::Path {
        match self {
            DevServerEvent::Status { project_path, .. }
            | DevServerEvent::Output { project_path, .. }
            | DevServerEvent::Exited { project_path, .. } => project_path,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevServerStatus {
    pub running: bool,
    pub url: Option<String>,
    pub stage: Option<DevServerStage>,
    pub pid: Option<u32>,
}

/// Result of a successful start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    /// `None` when the server is presumed up but no URL could be confirmed.
    pub url: Option<String>,
    pub pid: Option<u32>,
}

/// Runtime policy for the supervisor.
///
/// Distinct from `config::DevServerConfig` which is the TOML-deserialized schema type.
#[derive(Debug, Clone)]
pub struct DevServerPolicy {
    pub command: Option<String>,
    pub install_command: Option<String>,
    pub max_attempts: u32,
    pub startup_timeout: Duration,
    pub probe_timeout: Duration,
    pub probe_ports: Vec<u16>,
    pub crash_window: Duration,
    pub max_crashes: usize,
    pub stop_grace: Duration,
    pub stop_ceiling: Duration,
    pub port_release_delay: Duration,
    pub bad_descriptor_delay: Duration,
    pub install_timeout: Duration,
    pub excerpt_bytes: usize,
    pub extra_path_dirs: Vec<String>,
}

impl Default for DevServerPolicy {
    fn default() -> Self {
        Self::from_config(&DevServerConfig::default())
    }
}

impl DevServerPolicy {
    pub fn from_config(cfg: &DevServerConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            install_command: cfg.install_command.clone(),
            max_attempts: cfg.max_attempts,
            startup_timeout: Duration::from_millis(cfg.startup_timeout_ms),
            probe_timeout: Duration::from_millis(cfg.probe_timeout_ms),
            probe_ports: cfg.probe_ports.clone(),
            crash_window: Duration::from_secs(cfg.crash_window_secs),
            max_crashes: cfg.max_crashes,
            stop_grace: Duration::from_millis(cfg.stop_grace_ms),
            stop_ceiling: Duration::from_millis(cfg.stop_ceiling_ms),
            port_release_delay: Duration::from_millis(cfg.port_release_delay_ms),
            bad_descriptor_delay: Duration::from_millis(cfg.bad_descriptor_delay_ms),
            install_timeout: Duration::from_secs(cfg.install_timeout_secs),
            excerpt_bytes: cfg.excerpt_bytes,
            extra_path_dirs: cfg.extra_path_dirs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_camel_case_with_kebab_stages() {
        let event = DevServerEvent::Status {
            project_path: PathBuf::from("/tmp/app"),
            stage: DevServerStage::KillingPort,
            message: "Freeing port 3000".to_string(),
            url: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["projectPath"], "/tmp/app");
        assert_eq!(json["stage"], "killing-port");

        let exited = DevServerEvent::Exited {
            project_path: PathBuf::from("/tmp/app"),
            exit_code: Some(1),
        };
        let json = serde_json::to_value(&exited).unwrap();
        assert_eq!(json["type"], "exited");
        assert_eq!(json["exitCode"], 1);
    }

    #[test]
    fn policy_follows_config() {
        let cfg = DevServerConfig {
            max_attempts: 2,
            startup_timeout_ms: 1500,
            ..DevServerConfig::default()
        };
        let policy = DevServerPolicy::from_config(&cfg);
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.startup_timeout, Duration::from_millis(1500));
        assert_eq!(policy.crash_window, Duration::from_secs(60));
        assert_eq!(policy.max_crashes, 5);
    }

    #[test]
    fn crashed_error_renders_missing_code() {
        let err = DevServerError::Crashed {
            exit_code: None,
            detail: "killed".to_string(),
        };
        assert_eq!(err.to_string(), "dev server exited with code none: killed");
    }
}
