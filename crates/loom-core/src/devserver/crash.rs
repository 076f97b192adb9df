use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Sliding-window crash timestamps per project.
///
/// Only timestamps inside the window are counted; older ones are pruned on
/// every access.
#[derive(Debug)]
pub struct CrashHistory {
    window: Duration,
    max_crashes: usize,
    crashes: Mutex<HashMap<PathBuf, Vec<Instant>>>,
}

impl CrashHistory {
    pub fn new(window: Duration, max_crashes: usize) -> Self {
        Self {
            window,
            max_crashes,
            crashes: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a crash now and return the in-window count including it.
    pub fn record(&self, project: &Path) -> usize {
        let now = Instant::now();
        let mut crashes = self.crashes.lock().unwrap_or_else(|e| e.into_inner());
        let entries = crashes.entry(project.to_path_buf()).or_default();
        prune(entries, now, self.window);
        entries.push(now);
        entries.len()
    }

    /// Crashes for `project` within the window.
    pub fn count(&self, project: &Path) -> usize {
        let now = Instant::now();
        let mut crashes = self.crashes.lock().unwrap_or_else(|e| e.into_inner());
        match crashes.get_mut(project) {
            Some(entries) => {
                prune(entries, now, self.window);
                let count = entries.len();
                if count == 0 {
                    crashes.remove(project);
                }
                count
            }
            None => 0,
        }
    }

    /// `true` once the in-window count has reached the limit.
    pub fn is_looping(&self, project: &Path) -> bool {
        self.count(project) >= self.max_crashes
    }

    pub fn clear(&self, project: &Path) {
        let mut crashes = self.crashes.lock().unwrap_or_else(|e| e.into_inner());
        crashes.remove(project);
    }
}

fn prune(entries: &mut Vec<Instant>, now: Instant, window: Duration) {
    entries.retain(|at| now.saturating_duration_since(*at) < window);
}
