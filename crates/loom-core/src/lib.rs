pub mod config;
pub mod devserver;
pub mod diagnostics;
pub mod error;
pub mod fault;
pub mod platform;
pub mod repo;
pub mod retry;
pub mod spawn_gate;

pub use error::{LoomError, Result};

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
