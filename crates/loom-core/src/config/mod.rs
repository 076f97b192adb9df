use std::path::Path;

use thiserror::Error;

mod schema;

pub use schema::{DevServerConfig, DiagnosticsConfig, LoomConfig, RepoConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("config validation error: {message}")]
    Validation { message: String },
}

/// Load and validate a `LoomConfig` from a TOML file path.
///
/// Returns the default config if the file does not exist.
pub fn load_config(path: &Path) -> Result<LoomConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(LoomConfig::default());
    }

    let data = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        source: e,
    })?;

    parse_config(&data)
}

/// Parse and validate a `LoomConfig` from a TOML string.
pub fn parse_config(data: &str) -> Result<LoomConfig, ConfigError> {
    let config: LoomConfig = toml::from_str(data)?;
    validate(&config)?;
    Ok(config)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

fn validate(config: &LoomConfig) -> Result<(), ConfigError> {
    let dev = &config.devserver;
    if dev.max_attempts == 0 {
        return Err(invalid("devserver.max_attempts must be > 0"));
    }
    if dev.startup_timeout_ms == 0 {
        return Err(invalid("devserver.startup_timeout_ms must be > 0"));
    }
    if dev.probe_timeout_ms == 0 {
        return Err(invalid("devserver.probe_timeout_ms must be > 0"));
    }
    if dev.probe_ports.is_empty() {
        return Err(invalid("devserver.probe_ports must not be empty"));
    }
    if dev.probe_ports.contains(&0) {
        return Err(invalid("devserver.probe_ports must not contain port 0"));
    }
    if dev.max_crashes == 0 {
        return Err(invalid("devserver.max_crashes must be > 0"));
    }
    if dev.crash_window_secs == 0 {
        return Err(invalid("devserver.crash_window_secs must be > 0"));
    }
    if dev.stop_ceiling_ms < dev.stop_grace_ms {
        return Err(invalid(format!(
            "devserver.stop_ceiling_ms ({}) must be >= devserver.stop_grace_ms ({})",
            dev.stop_ceiling_ms, dev.stop_grace_ms
        )));
    }
    if dev.install_timeout_secs == 0 {
        return Err(invalid("devserver.install_timeout_secs must be > 0"));
    }
    if dev.excerpt_bytes == 0 {
        return Err(invalid("devserver.excerpt_bytes must be > 0"));
    }

    if config.repo.git_program.trim().is_empty() {
        return Err(invalid("repo.git_program must not be empty"));
    }
    if config.repo.command_timeout_secs == 0 {
        return Err(invalid("repo.command_timeout_secs must be > 0"));
    }

    if config.diagnostics.sample_limit == 0 {
        return Err(invalid("diagnostics.sample_limit must be > 0"));
    }

    Ok(())
}
