//! End-to-end tests for the job manager, driving `sh -c` scripts as the
//! converter.
//!
//! The converter is invoked as `sh -c <script> sh <source>`, so scripts see
//! the source reference as `$1` and run inside the job's scratch directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use mp3ify_core::resolver::{SourceId, SourceResolver};
use mp3ify_events::{EventKind, JobEvent, StreamItem};
use mp3ify_pipeline::manager::INTERRUPTED_REASON;
use mp3ify_pipeline::{ConverterConfig, EngineConfig, Job, JobManager, JobStatus, ManagerError};

/// Resolves every source except those starting with `B`.
struct LetterResolver;

impl SourceResolver for LetterResolver {
    fn resolve(&self, source: &str) -> Option<SourceId> {
        (!source.starts_with('B')).then(|| SourceId::new("test", source))
    }
}

fn config(root: &Path, script: &str) -> EngineConfig {
    let mut config = EngineConfig::rooted_at(
        root,
        ConverterConfig::new("sh", ["-c", script, "sh", "{source}"]),
    );
    config.reap_interval = Duration::from_millis(20);
    config
}

fn start(root: &Path, script: &str) -> Arc<JobManager> {
    JobManager::start(config(root, script), Box::new(LetterResolver)).expect("manager starts")
}

async fn wait_terminal(job: &Job) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !job.status().is_terminal() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job should reach a terminal state");
}

async fn wait_status(job: &Job, status: JobStatus) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while job.status() != status {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job should reach {status}"));
}

fn events_of(job: &Job) -> Vec<JobEvent> {
    job.events().events_from(0)
}

/// A script that blocks until `release` exists, then produces a file.
fn gated_script(release: &Path) -> String {
    format!(
        "while [ ! -f '{}' ]; do sleep 0.02; done; echo converted; echo audio > \"Song-$1.mp3\"",
        release.display()
    )
}

// ---------------------------------------------------------------------------
// Test: a successful conversion
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn successful_conversion_records_result() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = start(tmp.path(), "echo line1; echo line2; echo audio > \"Song-$1.mp3\"");

    let job = manager.submit("A").expect("submit");
    wait_terminal(&job).await;

    assert_eq!(job.status(), JobStatus::Successful);
    assert_eq!(job.result_name().as_deref(), Some("Song.mp3"));
    assert!(job.failure_reason().is_none());

    let events = events_of(&job);
    let lines: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::OutputLine)
        .map(|e| e.payload.as_str())
        .collect();
    assert_eq!(lines, vec!["line1", "line2"]);

    let successes = events
        .iter()
        .filter(|e| e.kind == EventKind::StatusChange && e.payload == "SUCCESSFUL")
        .count();
    assert_eq!(successes, 1);
    assert_eq!(events.first().map(|e| e.payload.as_str()), Some("CONVERTING"));

    let artifact = manager.result_file(&job).expect("result file");
    assert_eq!(artifact.name, "Song.mp3");
    assert!(artifact.path.is_file());

    let stored = manager.get(job.id()).expect("stored");
    assert_eq!(stored.status(), JobStatus::Successful);

    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: an unresolvable source fails immediately
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unresolvable_source_fails_without_events() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = start(tmp.path(), "exit 0");

    let job = manager.submit("B-not-a-video").expect("submit");

    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job.failure_reason().is_some());
    assert!(job.events().is_empty());
    assert_eq!(manager.enqueued(), 0);
    assert_eq!(
        manager.get(job.id()).map(|j| j.status()),
        Some(JobStatus::Failed)
    );

    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: duplicate submissions share one job
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resubmission_while_converting_returns_same_job() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let release = tmp.path().join("release");
    let manager = start(tmp.path(), &gated_script(&release));

    let first = manager.submit("A").expect("submit");
    wait_status(&first, JobStatus::Converting).await;
    let second = manager.submit("A").expect("resubmit");

    assert_eq!(first.id(), second.id());
    assert_eq!(manager.enqueued(), 1);

    std::fs::write(&release, b"").expect("release");
    wait_terminal(&first).await;
    assert_eq!(first.status(), JobStatus::Successful);

    let third = manager.submit("A").expect("submit after success");
    assert_eq!(third.id(), first.id());
    assert_eq!(manager.enqueued(), 1);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_are_deduplicated() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let release = tmp.path().join("release");
    let manager = start(tmp.path(), &gated_script(&release));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::task::spawn_blocking(move || manager.submit("A").expect("submit"))
        })
        .collect();
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.expect("join").id().to_string());
    }
    ids.dedup();

    assert_eq!(ids.len(), 1);
    assert_eq!(manager.enqueued(), 1);

    std::fs::write(&release, b"").expect("release");
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: failure and retry
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bad_exit_code_fails_and_allows_retry() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = start(tmp.path(), "echo partial-output; exit 1");

    let failed = manager.submit("A").expect("submit");
    wait_terminal(&failed).await;

    assert_eq!(failed.status(), JobStatus::Failed);
    assert!(failed.failure_reason().expect("reason").contains('1'));
    assert!(failed.raw_output().expect("raw output").contains("partial-output"));
    assert!(failed.result_name().is_none());

    let retry = manager.submit("A").expect("retry");
    assert_ne!(retry.id(), failed.id());
    assert_eq!(manager.enqueued(), 2);
    wait_terminal(&retry).await;

    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: delete
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_removes_job_and_artifact() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = start(tmp.path(), "echo audio > out.mp3");

    let job = manager.submit("A").expect("submit");
    wait_terminal(&job).await;
    let artifact = manager.result_file(&job).expect("artifact");

    manager.delete(job.id()).expect("delete");

    assert!(manager.get(job.id()).is_none());
    assert!(!artifact.path.exists());
    assert!(manager.artifacts().lookup("test-A").is_none());
    assert!(manager.list(|_| true).is_empty());

    manager.delete(job.id()).expect("delete is idempotent");

    let fresh = manager.submit("A").expect("submit after delete");
    assert_ne!(fresh.id(), job.id());

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deleted_running_job_is_not_resurrected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let release = tmp.path().join("release");
    let manager = start(tmp.path(), &gated_script(&release));

    let job = manager.submit("A").expect("submit");
    wait_status(&job, JobStatus::Converting).await;
    manager.delete(job.id()).expect("delete");

    std::fs::write(&release, b"").expect("release");
    wait_terminal(&job).await;

    assert!(manager.get(job.id()).is_none());
    assert!(manager.list(|s| s.id == job.id()).is_empty());
    assert!(manager.artifacts().lookup("test-A").is_none());

    // The next submission converts again instead of reusing a stray file.
    let retry = manager.submit("A").expect("resubmit");
    assert_ne!(retry.id(), job.id());
    wait_terminal(&retry).await;
    assert_eq!(retry.status(), JobStatus::Successful);
    assert!(retry.process_id().is_some());

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submission_after_shutdown_leaves_no_record() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = start(tmp.path(), "echo audio > \"Song-$1.mp3\"");
    manager.shutdown().await;

    assert_matches!(manager.submit("A"), Err(ManagerError::PoolClosed));
    assert!(manager.list(|_| true).is_empty());
    drop(manager);

    // A restarted engine accepts the same source as a fresh job.
    let manager = start(tmp.path(), "echo audio > \"Song-$1.mp3\"");
    let job = manager.submit("A").expect("submit");
    wait_terminal(&job).await;
    assert_eq!(job.status(), JobStatus::Successful);
    assert!(job.process_id().is_some());

    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: artifact reuse and listing
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn existing_artifact_is_reused_without_spawning() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = start(tmp.path(), "echo should-not-run; exit 1");

    let produced = tmp.path().join("cached.mp3");
    std::fs::write(&produced, b"audio").expect("write");
    manager
        .artifacts()
        .store("test-A", &produced, "Cached.mp3")
        .expect("store");

    let job = manager.submit("A").expect("submit");
    wait_terminal(&job).await;

    assert_eq!(job.status(), JobStatus::Successful);
    assert_eq!(job.result_name().as_deref(), Some("Cached.mp3"));
    assert!(job.process_id().is_none());

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn list_returns_detached_snapshots() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = start(tmp.path(), "echo audio > out.mp3");

    let ok = manager.submit("A").expect("submit");
    let bad = manager.submit("B").expect("submit");
    wait_terminal(&ok).await;

    let successful = manager.list(|s| s.status == JobStatus::Successful);
    assert_eq!(successful.len(), 1);
    assert_eq!(successful[0].id, ok.id());
    assert!(successful[0].completed_at.is_some());

    let all = manager.list(|_| true);
    assert_eq!(all.len(), 2);
    assert!(all.iter().any(|s| s.id == bad.id()));

    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: subscribers
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn live_capture_matches_replay_after_completion() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let release = tmp.path().join("release");
    let manager = start(tmp.path(), &gated_script(&release));

    let job = manager.submit("A").expect("submit");
    let mut live = manager.subscribe(&job, 0);
    wait_status(&job, JobStatus::Converting).await;
    std::fs::write(&release, b"").expect("release");

    let mut captured = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let StreamItem::Event(event) = live.next().await {
                let done = event.kind == EventKind::StatusChange && event.payload == "SUCCESSFUL";
                captured.push(event);
                if done {
                    break;
                }
            }
        }
    })
    .await
    .expect("live subscriber should see completion");

    for (position, event) in captured.iter().enumerate() {
        assert_eq!(event.index, position as u64);
    }
    assert_eq!(captured, events_of(&job));

    let resumed: Vec<_> = events_of(&job).into_iter().skip(1).collect();
    let mut late = manager.subscribe(&job, 1);
    let mut replayed = Vec::new();
    while replayed.len() < resumed.len() {
        if let StreamItem::Event(event) = late.next().await {
            replayed.push(event);
        }
    }
    assert_eq!(replayed, resumed);

    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: persistence across restarts
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn records_survive_restart() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = start(tmp.path(), "echo audio > out.mp3");
    let job = manager.submit("A").expect("submit");
    wait_terminal(&job).await;
    manager.shutdown().await;
    drop(manager);

    let restarted = start(tmp.path(), "exit 1");
    let reloaded = restarted.get(job.id()).expect("job persisted");

    assert_eq!(reloaded.status(), JobStatus::Successful);
    assert_eq!(reloaded.result_name(), job.result_name());
    assert!(reloaded.events().is_empty());
    assert!(restarted.result_file(&reloaded).is_some());

    let again = restarted.submit("A").expect("submit");
    assert_eq!(again.id(), job.id());
    assert_eq!(restarted.enqueued(), 0);

    restarted.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unfinished_jobs_are_failed_on_restart() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let release = tmp.path().join("release");
    let manager = start(tmp.path(), &gated_script(&release));
    let job = manager.submit("A").expect("submit");
    tokio::time::timeout(Duration::from_secs(10), async {
        while manager.list(|s| s.status == JobStatus::Converting).is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("CONVERTING should be persisted");
    manager.shutdown().await;

    let restarted = start(tmp.path(), "echo audio > out.mp3");
    let reloaded = restarted.get(job.id()).expect("job persisted");
    assert_eq!(reloaded.status(), JobStatus::Failed);
    assert_eq!(reloaded.failure_reason().as_deref(), Some(INTERRUPTED_REASON));

    let retry = restarted.submit("A").expect("retry");
    assert_ne!(retry.id(), job.id());

    std::fs::write(&release, b"").expect("release");
    wait_terminal(&retry).await;
    restarted.shutdown().await;
}
