use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Cooldown after terminal churn before new processes are spawned.
///
/// The terminal collaborator calls [`SpawnGate::note_churn`] whenever one of
/// its pty sessions is torn down; spawns that go through [`SpawnGate::wait`]
/// are held back until the cooldown has passed since the latest churn.
#[derive(Debug)]
pub struct SpawnGate {
    cooldown: Duration,
    last_churn: Mutex<Option<Instant>>,
}

impl SpawnGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_churn: Mutex::new(None),
        }
    }

    /// Record that terminal churn happened just now.
    pub fn note_churn(&self) {
        *self.last_churn.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Time left until the gate opens.
    pub fn remaining(&self) -> Duration {
        let last = *self.last_churn.lock().unwrap_or_else(|e| e.into_inner());
        match last {
            Some(at) => self.cooldown.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Wait until the cooldown since the latest churn has elapsed.
    pub async fn wait(&self) {
        loop {
            let remaining = self.remaining();
            if remaining.is_zero() {
                return;
            }
            debug!(
                delay_ms = remaining.as_millis() as u64,
                "delaying spawn after terminal churn"
            );
            tokio::time::sleep(remaining).await;
        }
    }
}

impl Default for SpawnGate {
    fn default() -> Self {
        Self::new(Duration::from_millis(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn open_without_churn() {
        let gate = SpawnGate::default();
        let start = Instant::now();
        gate.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_out_cooldown_after_churn() {
        let gate = SpawnGate::new(Duration::from_millis(300));
        gate.note_churn();
        tokio::time::advance(Duration::from_millis(100)).await;

        let start = Instant::now();
        gate.wait().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(210));
    }

    #[tokio::test(start_paused = true)]
    async fn churn_during_wait_extends_it() {
        let gate = std::sync::Arc::new(SpawnGate::new(Duration::from_millis(300)));
        gate.note_churn();

        let churner = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            churner.note_churn();
        });

        let start = Instant::now();
        gate.wait().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(510));
    }
}
