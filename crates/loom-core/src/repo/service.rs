use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::exec::{GitCommandOutput, GitExecError};
use super::handle::{GitOperation, GitRepository, HandleRegistry};
use super::queue::RepoQueue;
use super::root::RepoRootResolver;
use crate::config::RepoConfig;
use crate::diagnostics::FaultRecorder;
use crate::retry::RetryPolicy;
use crate::spawn_gate::SpawnGate;

/// Entry point for every version-control feature.
///
/// Requests are resolved to their canonical root, bound to that root's cached
/// [`GitRepository`], and funnelled through the root's [`RepoQueue`] lane.
pub struct RepoService {
    config: RepoConfig,
    resolver: Arc<RepoRootResolver>,
    handles: Arc<HandleRegistry>,
    queue: RepoQueue,
}

impl RepoService {
    pub fn new(
        config: RepoConfig,
        resolver: Arc<RepoRootResolver>,
        gate: Arc<SpawnGate>,
        recorder: Arc<dyn FaultRecorder>,
    ) -> Self {
        let handles = Arc::new(HandleRegistry::new());
        let queue = RepoQueue::new(
            resolver.clone(),
            gate,
            recorder,
            handles.clone(),
            RetryPolicy::from_repo_config(&config),
        );
        Self {
            config,
            resolver,
            handles,
            queue,
        }
    }

    /// Canonical repository root for `path`.
    pub fn resolve_root(&self, path: &Path) -> PathBuf {
        self.resolver.resolve(path)
    }

    pub async fn run(
        &self,
        path: &Path,
        op: GitOperation,
    ) -> Result<GitCommandOutput, GitExecError> {
        let root = self.resolver.resolve(path);
        let handle = self
            .handles
            .get_or_create(&root, || GitRepository::from_config(root.clone(), &self.config));
        let label = op.label();
        debug!(root = %root.display(), op = %label, "enqueueing repository operation");

        self.queue
            .enqueue(&root, &label, move || {
                let handle = handle.clone();
                let op = op.clone();
                async move { handle.execute(&op).await }
            })
            .await
    }

    /// Forget the cached handle and root mapping for `path`. Operations
    /// already queued still run.
    pub fn cleanup(&self, path: &Path) {
        let root = self.resolver.resolve(path);
        self.handles.remove(&root);
        self.resolver.invalidate(path);
        self.resolver.invalidate(&root);
        info!(root = %root.display(), "released repository handle");
    }

    pub fn cleanup_all(&self) {
        let released = self.handles.len();
        self.handles.clear();
        self.resolver.clear();
        info!(released, "released all repository handles");
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn queue(&self) -> &RepoQueue {
        &self.queue
    }
}
