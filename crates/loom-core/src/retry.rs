use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RepoConfig;
use crate::fault::is_transient_descriptor_fault;

/// Retry policy for the transient descriptor fault.
///
/// The delay is fixed rather than exponential: the fault lasts until the
/// leaking process has exited, and waiting longer does not change the odds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(150),
        }
    }
}

impl RetryPolicy {
    pub fn from_repo_config(cfg: &RepoConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            delay: Duration::from_millis(cfg.retry_delay_ms),
        }
    }
}

/// Run `op` up to `max_retries + 1` times, retrying only on the transient
/// descriptor fault.
///
/// Any other error is returned immediately. `on_first_fault` runs once, on
/// the first transient failure of this call, before the first retry delay.
pub async fn with_retry<T, E, F, Fut, D>(
    mut op: F,
    policy: RetryPolicy,
    context: &str,
    on_first_fault: D,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
    D: FnOnce(),
{
    let mut on_first_fault = Some(on_first_fault);
    let mut retries = 0u32;

    loop {
        match op().await {
            Ok(value) => {
                if retries > 0 {
                    debug!(context, retries, "recovered from transient descriptor fault");
                }
                return Ok(value);
            }
            Err(err) => {
                if !is_transient_descriptor_fault(&err) {
                    return Err(err);
                }
                if retries >= policy.max_retries {
                    warn!(
                        context,
                        retries,
                        error = %err,
                        "transient descriptor fault persisted; giving up"
                    );
                    return Err(err);
                }
                if let Some(hook) = on_first_fault.take() {
                    hook();
                }
                retries += 1;
                warn!(
                    context,
                    attempt = retries,
                    max_retries = policy.max_retries,
                    error = %err,
                    "transient descriptor fault; retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}
