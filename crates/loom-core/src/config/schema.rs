use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `loom.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoomConfig {
    pub devserver: DevServerConfig,
    pub repo: RepoConfig,
    pub diagnostics: DiagnosticsConfig,
}

/// Dev server supervisor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DevServerConfig {
    /// Shell command overriding the one detected from `package.json`.
    pub command: Option<String>,
    /// Shell command overriding `<package manager> install`.
    pub install_command: Option<String>,
    pub max_attempts: u32,
    pub startup_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub probe_ports: Vec<u16>,
    pub crash_window_secs: u64,
    pub max_crashes: usize,
    pub stop_grace_ms: u64,
    pub stop_ceiling_ms: u64,
    pub port_release_delay_ms: u64,
    pub bad_descriptor_delay_ms: u64,
    pub install_timeout_secs: u64,
    pub excerpt_bytes: usize,
    /// Additional directories appended to the child's `PATH`.
    pub extra_path_dirs: Vec<String>,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            command: None,
            install_command: None,
            max_attempts: 4,
            startup_timeout_ms: 30_000,
            probe_timeout_ms: 800,
            probe_ports: vec![5173, 3000, 8080, 4321, 8000, 4200, 5000, 3001, 8081],
            crash_window_secs: 60,
            max_crashes: 5,
            stop_grace_ms: 3_000,
            stop_ceiling_ms: 10_000,
            port_release_delay_ms: 500,
            bad_descriptor_delay_ms: 500,
            install_timeout_secs: 600,
            excerpt_bytes: 500,
            extra_path_dirs: Vec::new(),
        }
    }
}

/// Repository command execution configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RepoConfig {
    pub git_program: String,
    pub command_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub spawn_gate_ms: u64,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            git_program: "git".to_string(),
            command_timeout_secs: 300,
            max_retries: 3,
            retry_delay_ms: 150,
            spawn_gate_ms: 300,
        }
    }
}

/// Descriptor diagnostics configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DiagnosticsConfig {
    pub throttle_ms: u64,
    pub sample_limit: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 2_000,
            sample_limit: 256,
        }
    }
}
