//! Repository service against real git repositories.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use loom_core::config::RepoConfig;
use loom_core::diagnostics::{FaultRecorder, NoopRecorder};
use loom_core::repo::{run_git, GitExecError, GitOperation, RepoRootResolver, RepoService};
use loom_core::spawn_gate::SpawnGate;
use tempfile::TempDir;

async fn init_test_repo(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    run_git(&["init"], dir).await.unwrap();
    run_git(&["config", "user.email", "test@loom.dev"], dir)
        .await
        .unwrap();
    run_git(&["config", "user.name", "Loom Test"], dir)
        .await
        .unwrap();
    run_git(
        &["remote", "add", "origin", "https://example.com/app.git"],
        dir,
    )
    .await
    .unwrap();
}

fn service() -> RepoService {
    RepoService::new(
        RepoConfig::default(),
        Arc::new(RepoRootResolver::new()),
        Arc::new(SpawnGate::default()),
        Arc::new(NoopRecorder),
    )
}

#[tokio::test]
async fn operations_through_a_parent_folder_reach_the_nested_repository() {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("site");
    init_test_repo(&repo).await;
    std::fs::write(repo.join("index.html"), "<h1>hi</h1>").unwrap();

    let service = service();
    assert_eq!(
        service.resolve_root(tmp.path()),
        std::fs::canonicalize(&repo).unwrap()
    );

    service
        .run(
            tmp.path(),
            GitOperation::Add {
                paths: vec!["index.html".to_string()],
            },
        )
        .await
        .unwrap();
    service
        .run(
            tmp.path(),
            GitOperation::Commit {
                message: "first page".to_string(),
                all: false,
            },
        )
        .await
        .unwrap();

    let log = service
        .run(&repo, GitOperation::Log { max_count: 5 })
        .await
        .unwrap();
    assert!(log.stdout.contains("first page"));
    assert_eq!(log.exit_code, Some(0));
    assert_eq!(service.handle_count(), 1);
}

#[tokio::test]
async fn git_failures_pass_through_unchanged() {
    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).await;
    let service = service();

    let err = service
        .run(
            tmp.path(),
            GitOperation::Checkout {
                branch: "does-not-exist".to_string(),
                create: false,
            },
        )
        .await
        .unwrap_err();
    match err {
        GitExecError::NonZeroExit { stderr, .. } => assert!(stderr.contains("does-not-exist")),
        other => panic!("unexpected error: {other}"),
    }

    // The lane is not poisoned by the failure.
    let status = service.run(tmp.path(), GitOperation::Status).await.unwrap();
    assert!(status.stdout.starts_with("##"));
}

#[tokio::test]
async fn cleanup_releases_handles_and_root_cache() {
    let tmp = TempDir::new().unwrap();
    let a = tmp.path().join("a");
    let b = tmp.path().join("b");
    init_test_repo(&a).await;
    init_test_repo(&b).await;
    let service = service();

    service.run(&a, GitOperation::Status).await.unwrap();
    service.run(&b, GitOperation::Status).await.unwrap();
    assert_eq!(service.handle_count(), 2);

    service.cleanup(&a);
    assert_eq!(service.handle_count(), 1);

    service.run(&a, GitOperation::CurrentBranch).await.unwrap();
    assert_eq!(service.handle_count(), 2);

    service.cleanup_all();
    assert_eq!(service.handle_count(), 0);
    assert_eq!(service.queue().active_lanes(), 0);
}

#[tokio::test]
async fn non_transient_failures_do_not_trigger_diagnostics() {
    struct Counting(AtomicUsize);
    impl FaultRecorder for Counting {
        fn record(&self, _context: &str, _queue_depth: usize, _handle_count: usize) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let tmp = TempDir::new().unwrap();
    init_test_repo(tmp.path()).await;
    let recorder = Arc::new(Counting(AtomicUsize::new(0)));
    let service = RepoService::new(
        RepoConfig::default(),
        Arc::new(RepoRootResolver::new()),
        Arc::new(SpawnGate::default()),
        recorder.clone(),
    );

    let _ = service
        .run(
            tmp.path(),
            GitOperation::Raw {
                args: vec!["no-such-subcommand".to_string()],
            },
        )
        .await
        .unwrap_err();
    assert_eq!(recorder.0.load(Ordering::SeqCst), 0);
}
