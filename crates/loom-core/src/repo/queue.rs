//! Per-repository FIFO execution.
//!
//! Each canonical root gets a lane: a worker task draining an unbounded
//! channel of jobs, one at a time. Lanes are created on first submission and
//! removed by their worker once the last pending job has finished. Submission
//! and removal both happen under the lane-table lock, so a job can never be
//! sent to a worker that is about to exit.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tracing::{debug, warn};

use super::handle::HandleRegistry;
use super::root::RepoRootResolver;
use crate::diagnostics::FaultRecorder;
use crate::retry::{with_retry, RetryPolicy};
use crate::spawn_gate::SpawnGate;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Lane {
    tx: mpsc::UnboundedSender<Job>,
    pending: usize,
}

type LaneTable = Arc<Mutex<HashMap<PathBuf, Lane>>>;

/// Serializes operations per repository root.
pub struct RepoQueue {
    resolver: Arc<RepoRootResolver>,
    gate: Arc<SpawnGate>,
    recorder: Arc<dyn FaultRecorder>,
    handles: Arc<HandleRegistry>,
    policy: RetryPolicy,
    lanes: LaneTable,
}

impl RepoQueue {
    pub fn new(
        resolver: Arc<RepoRootResolver>,
        gate: Arc<SpawnGate>,
        recorder: Arc<dyn FaultRecorder>,
        handles: Arc<HandleRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            resolver,
            gate,
            recorder,
            handles,
            policy,
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Operations submitted but not yet finished, across all roots.
    pub fn depth(&self) -> usize {
        queue_depth(&self.lanes)
    }

    /// Number of roots with a live lane.
    pub fn active_lanes(&self) -> usize {
        lock(&self.lanes).len()
    }

    /// Run `op` after every operation previously enqueued for the same
    /// repository root has finished, successful or not.
    ///
    /// `path` is resolved to its canonical root first, so equivalent paths
    /// share a lane. Before running, the job waits out the spawn gate; the
    /// operation itself is retried on the transient descriptor fault. The
    /// operation's own error is returned unchanged.
    ///
    /// If the lane's worker goes away before the operation reports back (the
    /// runtime is shutting down), an `io::Error` converted into `E` is returned.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from `op` on the caller's task.
    pub async fn enqueue<T, E, F, Fut>(&self, path: &Path, context: &str, op: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: std::error::Error + From<std::io::Error> + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let root = self.resolver.resolve(path);
        let (done_tx, done_rx) = oneshot::channel::<Result<Result<T, E>, JoinError>>();

        let gate = self.gate.clone();
        let recorder = self.recorder.clone();
        let handles = self.handles.clone();
        let lanes = self.lanes.clone();
        let policy = self.policy;
        let context = context.to_string();

        let run = async move {
            gate.wait().await;
            with_retry(op, policy, &context, || {
                recorder.record(&context, queue_depth(&lanes), handles.len());
            })
            .await
        };
        let job: Job = Box::pin(async move {
            let outcome = tokio::spawn(run).await;
            let _ = done_tx.send(outcome);
        });

        self.submit(root.clone(), job);

        settle(&root, done_rx.await)
    }

    fn submit(&self, root: PathBuf, job: Job) {
        let mut lanes = lock(&self.lanes);

        let job = match lanes.get_mut(&root) {
            Some(lane) => match lane.tx.send(job) {
                Ok(()) => {
                    lane.pending += 1;
                    debug!(root = %root.display(), pending = lane.pending, "queued repository operation");
                    return;
                }
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(job).is_err() {
            warn!(root = %root.display(), "repository lane closed before first job");
            return;
        }
        lanes.insert(root.clone(), Lane { tx, pending: 1 });
        debug!(root = %root.display(), "opened repository lane");
        tokio::spawn(drain_lane(root, rx, self.lanes.clone()));
    }
}

async fn drain_lane(root: PathBuf, mut rx: mpsc::UnboundedReceiver<Job>, lanes: LaneTable) {
    while let Some(job) = rx.recv().await {
        job.await;

        let mut table = lock(&lanes);
        let drained = match table.get_mut(&root) {
            Some(lane) => {
                lane.pending = lane.pending.saturating_sub(1);
                lane.pending == 0
            }
            None => false,
        };
        if drained {
            table.remove(&root);
            debug!(root = %root.display(), "closed idle repository lane");
            return;
        }
    }
}

/// Turn what the lane reported back into the caller's result.
fn settle<T, E>(
    root: &Path,
    reported: Result<Result<Result<T, E>, JoinError>, oneshot::error::RecvError>,
) -> Result<T, E>
where
    E: From<std::io::Error>,
{
    match reported {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => {
            std::panic::resume_unwind(join_err.into_panic())
        }
        Ok(Err(join_err)) => {
            warn!(root = %root.display(), error = %join_err, "repository operation was cancelled");
            Err(std::io::Error::other(format!(
                "repository operation for {} was cancelled",
                root.display()
            ))
            .into())
        }
        Err(_) => {
            warn!(root = %root.display(), "repository lane stopped before the operation finished");
            Err(std::io::Error::other(format!(
                "repository lane for {} stopped before the operation finished",
                root.display()
            ))
            .into())
        }
    }
}

fn queue_depth(lanes: &LaneTable) -> usize {
    lock(lanes).values().map(|lane| lane.pending).sum()
}

fn lock(lanes: &LaneTable) -> MutexGuard<'_, HashMap<PathBuf, Lane>> {
    lanes.lock().unwrap_or_else(|e| e.into_inner())
}
