//! Integration tests for the backup job processor.
//!
//! ```sh
//! cargo test --test backup_worker_tests
//! ```

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use backup_orchestrator_backend::error::{AppError, Result};
use backup_orchestrator_backend::models::destination::PolicyDestination;
use backup_orchestrator_backend::models::job::{
    ArtifactLocation, BackupJob, HistoryFilter, HistoryPage, JobFinish, JobManifest, JobStatus,
    JobTrigger, RestoreRequest,
};
use backup_orchestrator_backend::models::policy::{BackupPolicy, StoredPolicy};
use backup_orchestrator_backend::services::backup_worker::BackupWorker;
use backup_orchestrator_backend::store::{BackupStore, MemoryBackupStore, CANCELLED_BEFORE_START};

use common::{Behavior, TestEngine};

/// Every per-job work directory must be gone once the job has finished.
fn assert_scratch_empty(engine: &TestEngine) {
    let jobs = engine.scratch.path().join("jobs");
    let leftovers: Vec<_> = match std::fs::read_dir(&jobs) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => panic!("cannot read {}: {}", jobs.display(), e),
    };
    assert!(leftovers.is_empty(), "scratch not cleaned: {:?}", leftovers);
}

#[tokio::test]
async fn test_quorum_not_met_fails_job() {
    let engine = TestEngine::new();
    engine.seed_users().await;
    engine.save_policy(&["replica-a", "replica-b"], 3, 2).await;
    engine
        .adapters
        .script("replica-a", Behavior::Fail("bucket unreachable".into()))
        .await;

    let job = engine.store.create_job(JobTrigger::Manual).await.unwrap();
    let outcome = engine.worker.run_once().await.unwrap().expect("job processed");

    assert_eq!(outcome.job_id, job.id);
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.success_count, 2);
    assert_eq!(outcome.destination_count, 3);
    assert_eq!(
        outcome.note,
        "Quorum not met: 2 of 3 destinations succeeded, 3 required"
    );

    let stored = engine.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.artifact_location.is_none());
    assert!(stored.finished_at.is_some());
    assert!(!stored.verified);

    let log = engine.store.get_log(job.id).await.unwrap().unwrap();
    assert!(log.contains("Replication finished: 2/3 destinations succeeded"));
    assert!(log.contains("bucket unreachable"));

    // A failed job has no manifest.
    assert!(engine.store.get_manifest(job.id).await.unwrap().is_none());
    assert_scratch_empty(&engine);
}

#[tokio::test]
async fn test_quorum_met_completes_with_one_failed_replica() {
    let engine = TestEngine::new();
    engine.seed_users().await;
    engine.save_policy(&["replica-a", "replica-b"], 2, 2).await;
    engine
        .adapters
        .script("replica-b", Behavior::Fail("disk full".into()))
        .await;

    let job = engine.store.create_job(JobTrigger::Manual).await.unwrap();
    let outcome = engine.worker.run_once().await.unwrap().unwrap();
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.note, "Backup stored on 2/3 destinations");

    let stored = engine.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.verified);
    assert!(stored.size_bytes.unwrap() > 0);
    match stored.artifact_location {
        Some(ArtifactLocation::Local { path }) => {
            assert!(path.starts_with("/scripted/primary/backup-"));
            assert!(path.ends_with(".tar.gz"));
        }
        other => panic!("unexpected location {:?}", other),
    }

    let manifest = engine.store.get_manifest(job.id).await.unwrap().unwrap();
    assert_eq!(manifest.job_id, job.id);
    assert_eq!(manifest.checksum_sha256.len(), 64);
    assert_eq!(manifest.destinations.len(), 3);
    assert!(manifest.destinations[0].is_primary);
    let failed: Vec<_> = manifest.destinations.iter().filter(|d| !d.success).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "replica-b");
    assert_eq!(failed[0].error.as_deref(), Some("disk full"));

    let users = manifest.targets.iter().find(|t| t.name == "users").unwrap();
    assert_eq!(users.rows, 2);
    let devices = manifest.targets.iter().find(|t| t.name == "devices").unwrap();
    assert!(devices.file.is_none());
    assert_scratch_empty(&engine);
}

#[tokio::test]
async fn test_primary_failure_skips_replication() {
    let engine = TestEngine::new();
    engine.seed_users().await;
    engine.save_policy(&["replica-a", "replica-b"], 1, 2).await;
    engine
        .adapters
        .script("primary", Behavior::Fail("permission denied".into()))
        .await;

    let job = engine.store.create_job(JobTrigger::Manual).await.unwrap();
    let outcome = engine.worker.run_once().await.unwrap().unwrap();

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(
        outcome.note,
        "Primary upload to 'primary' failed: permission denied"
    );
    assert_eq!(engine.adapters.attempts().await, vec!["primary".to_string()]);

    let stored = engine.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_scratch_empty(&engine);
}

#[tokio::test]
async fn test_replicas_uploaded_with_bounded_parallelism() {
    let engine = TestEngine::new();
    engine.seed_users().await;
    let replicas = ["r1", "r2", "r3", "r4"];
    engine.save_policy(&replicas, 5, 2).await;
    for name in replicas {
        engine
            .adapters
            .script(name, Behavior::Slow(Duration::from_millis(50)))
            .await;
    }

    engine.store.create_job(JobTrigger::Manual).await.unwrap();
    let outcome = engine.worker.run_once().await.unwrap().unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.success_count, 5);
    assert_eq!(engine.adapters.max_concurrency(), 2);

    let attempts = engine.adapters.attempts().await;
    assert_eq!(attempts.len(), 5);
    assert_eq!(attempts[0], "primary");
}

#[tokio::test]
async fn test_worker_is_single_flight() {
    let engine = TestEngine::new();
    engine.seed_users().await;
    engine.save_policy(&[], 1, 1).await;
    engine
        .adapters
        .script("primary", Behavior::Slow(Duration::from_millis(300)))
        .await;
    let job = engine.store.create_job(JobTrigger::Manual).await.unwrap();

    let worker = Arc::clone(&engine.worker);
    let running = tokio::spawn(async move { worker.run_once().await });

    // Let the first run claim the worker.
    for _ in 0..100 {
        if engine.worker.is_busy() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(engine.worker.is_busy());
    assert!(engine.worker.run_once().await.unwrap().is_none());

    let outcome = running.await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.job_id, job.id);
    assert_eq!(outcome.status, JobStatus::Completed);
    assert!(!engine.worker.is_busy());
}

#[tokio::test]
async fn test_jobs_processed_oldest_first() {
    let engine = TestEngine::new();
    engine.save_policy(&[], 1, 1).await;
    let first = engine.store.create_job(JobTrigger::Scheduled).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = engine.store.create_job(JobTrigger::Manual).await.unwrap();

    let a = engine.worker.run_once().await.unwrap().unwrap();
    let b = engine.worker.run_once().await.unwrap().unwrap();
    assert_eq!(a.job_id, first.id);
    assert_eq!(b.job_id, second.id);
    assert!(engine.worker.run_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_before_start_is_swept() {
    let engine = TestEngine::new();
    engine.save_policy(&["replica-a"], 1, 1).await;
    let job = engine.store.create_job(JobTrigger::Manual).await.unwrap();
    assert!(engine.store.request_cancel(job.id).await.unwrap());

    assert!(engine.worker.run_once().await.unwrap().is_none());

    let stored = engine.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert_eq!(stored.note.as_deref(), Some(CANCELLED_BEFORE_START));
    assert!(engine.adapters.attempts().await.is_empty());
}

#[tokio::test]
async fn test_cancel_during_primary_upload_stops_before_replication() {
    let engine = TestEngine::new();
    engine.seed_users().await;
    engine.save_policy(&["replica-a", "replica-b"], 1, 2).await;
    engine
        .adapters
        .script("primary", Behavior::Slow(Duration::from_millis(300)))
        .await;
    let job = engine.store.create_job(JobTrigger::Manual).await.unwrap();

    let worker = Arc::clone(&engine.worker);
    let running = tokio::spawn(async move { worker.run_once().await });

    // Wait for the primary upload to start, then ask for cancellation.
    for _ in 0..100 {
        if !engine.adapters.attempts().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(engine.store.request_cancel(job.id).await.unwrap());

    let outcome = running.await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert_eq!(outcome.note, "Cancelled before replication");
    assert_eq!(engine.adapters.attempts().await, vec!["primary".to_string()]);

    // Cancelled jobs do not notify.
    assert!(engine.notifier.sent.lock().await.is_empty());
    assert_scratch_empty(&engine);
}

#[tokio::test]
async fn test_finished_job_notifies_enabled_channels() {
    let engine = TestEngine::new();
    engine.seed_users().await;
    engine.save_policy(&["replica-a"], 2, 1).await;
    let job = engine.store.create_job(JobTrigger::Manual).await.unwrap();

    engine.worker.run_once().await.unwrap().unwrap();

    let sent = engine.notifier.sent.lock().await;
    assert_eq!(sent.len(), 1);
    let (channels, subject, body) = &sent[0];
    assert!(channels.chat);
    assert!(!channels.email);
    assert!(subject.starts_with("Backup completed ("));
    assert!(body.contains(&job.id.to_string()));
    assert!(body.contains("replica-a"));
}

#[tokio::test]
async fn test_encrypted_policy_without_key_fails() {
    let engine = TestEngine::new();
    engine.seed_users().await;
    let mut update = common::policy_update("primary", &[]);
    update.encrypt = true;
    engine.policies.save_config(update).await.unwrap();

    engine.store.create_job(JobTrigger::Manual).await.unwrap();
    let outcome = engine.worker.run_once().await.unwrap().unwrap();
    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(engine.adapters.attempts().await.is_empty());
}

#[tokio::test]
async fn test_encrypted_archive_name_with_key() {
    let engine = TestEngine::with_config(|c| c.encryption_key = Some("s3cret-passphrase".into()));
    engine.seed_users().await;
    let mut update = common::policy_update("primary", &[]);
    update.encrypt = true;
    engine.policies.save_config(update).await.unwrap();

    let job = engine.store.create_job(JobTrigger::Manual).await.unwrap();
    let outcome = engine.worker.run_once().await.unwrap().unwrap();
    assert_eq!(outcome.status, JobStatus::Completed);

    let manifest = engine.store.get_manifest(job.id).await.unwrap().unwrap();
    assert!(manifest.encrypted);
    assert!(manifest.archive_name.ends_with(".tar.gz.enc"));
}

#[tokio::test]
async fn test_triggered_worker_replicates_in_background() {
    let engine = TestEngine::new();
    engine.seed_users().await;
    engine.save_policy(&["replica-a", "replica-b", "replica-c"], 4, 2).await;
    let job = engine.store.create_job(JobTrigger::Manual).await.unwrap();

    engine.worker.trigger();
    let finished = engine.wait_for_finish(job.id).await;

    assert_eq!(finished.status, JobStatus::Completed);
    let mut attempts = engine.adapters.attempts().await;
    assert_eq!(attempts.remove(0), "primary");
    attempts.sort();
    assert_eq!(attempts, vec!["replica-a", "replica-b", "replica-c"]);
    assert_scratch_empty(&engine);
}

#[tokio::test]
async fn test_quorum_failure_cleans_scratch() {
    let engine = TestEngine::new();
    engine.seed_users().await;
    engine.save_policy(&["replica-a"], 2, 1).await;
    engine
        .adapters
        .script("replica-a", Behavior::Fail("timeout".into()))
        .await;
    engine.store.create_job(JobTrigger::Manual).await.unwrap();

    let outcome = engine.worker.run_once().await.unwrap().unwrap();
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_scratch_empty(&engine);
}

/// Delegates to a memory store but fails the first `finish_failures` calls
/// to `finish_job`.
struct FlakyFinishStore {
    inner: Arc<MemoryBackupStore>,
    finish_failures: AtomicUsize,
    finish_calls: AtomicUsize,
}

impl FlakyFinishStore {
    fn new(inner: Arc<MemoryBackupStore>, finish_failures: usize) -> Self {
        Self {
            inner,
            finish_failures: AtomicUsize::new(finish_failures),
            finish_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BackupStore for FlakyFinishStore {
    async fn get_policy(&self) -> Result<Option<StoredPolicy>> {
        self.inner.get_policy().await
    }
    async fn save_policy(
        &self,
        policy: &BackupPolicy,
        destinations: &[PolicyDestination],
    ) -> Result<StoredPolicy> {
        self.inner.save_policy(policy, destinations).await
    }
    async fn mark_scheduled_once(
        &self,
        now: DateTime<Utc>,
        debounce: Duration,
    ) -> Result<bool> {
        self.inner.mark_scheduled_once(now, debounce).await
    }
    async fn create_job(&self, trigger: JobTrigger) -> Result<BackupJob> {
        self.inner.create_job(trigger).await
    }
    async fn get_job(&self, id: Uuid) -> Result<Option<BackupJob>> {
        self.inner.get_job(id).await
    }
    async fn next_runnable_job(&self) -> Result<Option<BackupJob>> {
        self.inner.next_runnable_job().await
    }
    async fn job_destinations(&self, id: Uuid) -> Result<Vec<PolicyDestination>> {
        self.inner.job_destinations(id).await
    }
    async fn sweep_cancelled(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.inner.sweep_cancelled(now).await
    }
    async fn finish_job(&self, id: Uuid, finish: &JobFinish) -> Result<bool> {
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .finish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::Database("connection reset".into()));
        }
        self.inner.finish_job(id, finish).await
    }
    async fn request_cancel(&self, id: Uuid) -> Result<bool> {
        self.inner.request_cancel(id).await
    }
    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool> {
        self.inner.is_cancel_requested(id).await
    }
    async fn reset_for_retry(&self, id: Uuid) -> Result<bool> {
        self.inner.reset_for_retry(id).await
    }
    async fn append_log(&self, id: Uuid, line: &str) -> Result<()> {
        self.inner.append_log(id, line).await
    }
    async fn get_log(&self, id: Uuid) -> Result<Option<String>> {
        self.inner.get_log(id).await
    }
    async fn save_manifest(&self, manifest: &JobManifest) -> Result<()> {
        self.inner.save_manifest(manifest).await
    }
    async fn get_manifest(&self, id: Uuid) -> Result<Option<JobManifest>> {
        self.inner.get_manifest(id).await
    }
    async fn list_history(&self, filter: &HistoryFilter) -> Result<HistoryPage> {
        self.inner.list_history(filter).await
    }
    async fn prune_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackupJob>> {
        self.inner.prune_jobs(cutoff).await
    }
    async fn create_restore_request(
        &self,
        job_id: Uuid,
        requested_by: Option<String>,
        note: Option<String>,
    ) -> Result<RestoreRequest> {
        self.inner.create_restore_request(job_id, requested_by, note).await
    }
    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}

fn worker_over(engine: &TestEngine, store: Arc<FlakyFinishStore>) -> BackupWorker {
    BackupWorker::new(
        store,
        engine.adapters.clone(),
        engine.exporter.clone(),
        engine.notifier.clone(),
        engine.config.scratch_dir.clone(),
        None,
    )
}

#[tokio::test]
async fn test_transient_finish_error_is_retried() {
    let engine = TestEngine::new();
    engine.seed_users().await;
    engine.save_policy(&["replica-a"], 2, 1).await;
    let store = Arc::new(FlakyFinishStore::new(engine.store.clone(), 1));
    let worker = worker_over(&engine, store.clone());
    let job = engine.store.create_job(JobTrigger::Manual).await.unwrap();

    let outcome = worker.run_once().await.unwrap().unwrap();
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(store.finish_calls.load(Ordering::SeqCst), 2);

    let stored = engine.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(engine.notifier.sent.lock().await.len(), 1);

    // Nothing is left to re-run.
    assert!(worker.run_once().await.unwrap().is_none());
    assert_eq!(engine.adapters.attempts().await.len(), 2);
}

#[tokio::test]
async fn test_persistent_finish_error_still_notifies() {
    let engine = TestEngine::new();
    engine.seed_users().await;
    engine.save_policy(&[], 1, 1).await;
    let store = Arc::new(FlakyFinishStore::new(engine.store.clone(), usize::MAX));
    let worker = worker_over(&engine, store.clone());
    engine.store.create_job(JobTrigger::Manual).await.unwrap();

    let outcome = worker.run_once().await.unwrap().unwrap();
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(store.finish_calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.notifier.sent.lock().await.len(), 1);
    assert_scratch_empty(&engine);
}
