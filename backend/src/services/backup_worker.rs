//! Single-flight backup job processor.
//!
//! One job runs end-to-end at a time: export, archive, primary upload,
//! bounded replica fan-out, quorum check, finalize. Cancellation is
//! cooperative: the flag is inspected between steps and an in-flight transfer
//! is always allowed to finish.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};

use crate::error::{AppError, Result};
use crate::models::destination::PolicyDestination;
use crate::models::job::{
    ArtifactLocation, BackupJob, DestinationOutcome, JobFinish, JobManifest, JobStatus,
};
use crate::models::policy::{BackupPolicy, NotificationChannels};
use crate::services::archive::{self, BuiltArchive};
use crate::services::metrics_service;
use crate::services::notification_service::{JobSummary, NotificationSink};
use crate::storage::AdapterFactory;
use crate::store::{BackupStore, DataExporter};

const FINISH_ATTEMPTS: u32 = 3;
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Result of processing one job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: uuid::Uuid,
    pub status: JobStatus,
    pub note: String,
    pub success_count: usize,
    pub destination_count: usize,
}

/// How `execute` ended, before it is written to the job row.
enum Ending {
    Completed {
        archive: BuiltArchive,
        location: ArtifactLocation,
        note: String,
    },
    Failed(String),
    Cancelled(String),
}

/// Per-run bookkeeping shared between the steps.
#[derive(Default)]
struct RunState {
    outcomes: Vec<DestinationOutcome>,
    destination_count: usize,
    notifications: NotificationChannels,
}

impl RunState {
    fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
        metrics_service::set_worker_busy(false);
    }
}

pub struct BackupWorker {
    store: Arc<dyn BackupStore>,
    adapters: Arc<dyn AdapterFactory>,
    exporter: Arc<dyn DataExporter>,
    notifier: Arc<dyn NotificationSink>,
    scratch_dir: PathBuf,
    encryption_key: Option<String>,
    busy: AtomicBool,
}

impl BackupWorker {
    pub fn new(
        store: Arc<dyn BackupStore>,
        adapters: Arc<dyn AdapterFactory>,
        exporter: Arc<dyn DataExporter>,
        notifier: Arc<dyn NotificationSink>,
        scratch_dir: PathBuf,
        encryption_key: Option<String>,
    ) -> Self {
        Self {
            store,
            adapters,
            exporter,
            notifier,
            scratch_dir,
            encryption_key,
            busy: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Wake the worker without waiting for it.
    pub fn trigger(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            worker.drain().await;
        });
    }

    /// Process runnable jobs until none are left or another caller holds the
    /// worker.
    pub async fn drain(&self) {
        loop {
            match self.run_once().await {
                Ok(Some(outcome)) => {
                    tracing::debug!(job_id = %outcome.job_id, status = %outcome.status, "Worker finished job");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Backup worker error: {}", e);
                    break;
                }
            }
        }
    }

    /// Process the oldest runnable job, if any. Returns `None` when idle or
    /// when another run is already in progress.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        let _guard = BusyGuard(&self.busy);
        metrics_service::set_worker_busy(true);

        for id in self.store.sweep_cancelled(Utc::now()).await? {
            tracing::info!(job_id = %id, "Cancelled job that never started");
        }

        let Some(job) = self.store.next_runnable_job().await? else {
            return Ok(None);
        };
        self.process(job).await.map(Some)
    }

    async fn log(&self, job: &BackupJob, message: impl AsRef<str>) {
        let line = format!("[{}] {}", Utc::now().to_rfc3339(), message.as_ref());
        if let Err(e) = self.store.append_log(job.id, &line).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to append job log");
        }
    }

    async fn cancelled_before(&self, job: &BackupJob, step: &str) -> Result<Option<Ending>> {
        if self.store.is_cancel_requested(job.id).await? {
            return Ok(Some(Ending::Cancelled(format!("Cancelled before {}", step))));
        }
        Ok(None)
    }

    /// Persist the terminal status, retrying transient store errors. The
    /// transfers are already done at this point, so a store that stays down
    /// is logged rather than propagated.
    async fn record_finish(&self, job: &BackupJob, finish: &JobFinish) {
        for attempt in 1..=FINISH_ATTEMPTS {
            match self.store.finish_job(job.id, finish).await {
                Ok(true) => return,
                Ok(false) => {
                    tracing::warn!(job_id = %job.id, "Job was no longer running when it finished");
                    return;
                }
                Err(e) if attempt < FINISH_ATTEMPTS => {
                    tracing::warn!(job_id = %job.id, attempt, error = %e, "Failed to record job result, retrying");
                    tokio::time::sleep(FINISH_RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %job.id,
                        status = %finish.status,
                        error = %e,
                        "Giving up recording job result"
                    );
                }
            }
        }
    }

    async fn process(&self, job: BackupJob) -> Result<JobOutcome> {
        let clock = Instant::now();
        tracing::info!(job_id = %job.id, trigger = job.trigger.as_str(), "Processing backup job");
        self.log(&job, format!("Job started ({})", job.trigger.as_str()))
            .await;

        let mut run = RunState::default();
        let ending = match self.execute(&job, &mut run).await {
            Ok(ending) => ending,
            Err(e) => Ending::Failed(e.to_string()),
        };
        let duration = clock.elapsed().as_secs_f64();

        let (finish, size) = match ending {
            Ending::Completed {
                archive,
                location,
                note,
            } => {
                let size = archive.size as i64;
                (JobFinish::completed(note, size, duration, location), Some(size))
            }
            Ending::Failed(note) => (JobFinish::failed(note, duration), None),
            Ending::Cancelled(note) => (JobFinish::cancelled(note, duration), None),
        };

        match finish.status {
            JobStatus::Completed => self.log(&job, format!("Completed: {}", finish.note)).await,
            JobStatus::Cancelled => self.log(&job, &finish.note).await,
            _ => self.log(&job, format!("Failed: {}", finish.note)).await,
        }
        self.record_finish(&job, &finish).await;

        metrics_service::record_backup(
            job.trigger.as_str(),
            &finish.status.to_string(),
            duration,
            size,
        );
        for outcome in &run.outcomes {
            metrics_service::record_destination_upload(
                outcome.kind.as_str(),
                outcome.is_primary,
                outcome.success,
            );
        }

        if finish.status != JobStatus::Cancelled && run.notifications.any() {
            let summary = JobSummary {
                job_id: job.id,
                status: finish.status,
                trigger: job.trigger,
                note: finish.note.clone(),
                size_bytes: finish.size_bytes,
                duration_sec: duration,
                destinations: run.outcomes.clone(),
            };
            self.notifier
                .send(&run.notifications, &summary.subject(), &summary.body())
                .await;
        }

        tracing::info!(
            job_id = %job.id,
            status = %finish.status,
            duration_secs = duration,
            "Backup job finished"
        );

        Ok(JobOutcome {
            job_id: job.id,
            status: finish.status,
            note: finish.note,
            success_count: run.success_count(),
            destination_count: run.destination_count,
        })
    }

    async fn execute(&self, job: &BackupJob, run: &mut RunState) -> Result<Ending> {
        let policy: BackupPolicy = match self.store.get_policy().await? {
            Some(stored) => stored.policy,
            None => return Ok(Ending::Failed("no backup policy has been configured".into())),
        };
        run.notifications = policy.notifications;

        let mut destinations = self.store.job_destinations(job.id).await?;
        run.destination_count = destinations.len();
        let Some(primary_index) = destinations.iter().position(|d| d.is_primary) else {
            return Ok(Ending::Failed("job has no primary destination".into()));
        };
        let primary = destinations.remove(primary_index);
        let mut replicas = destinations;
        replicas.sort_by(|a, b| {
            (a.priority, &a.destination.name).cmp(&(b.priority, &b.destination.name))
        });

        if let Some(ending) = self.cancelled_before(job, "export").await? {
            return Ok(ending);
        }
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let work = tempfile::Builder::new()
            .prefix("backup-job-")
            .tempdir_in(&self.scratch_dir)?;

        let exports = archive::export_targets(self.exporter.as_ref(), &policy.targets, work.path()).await?;
        for export in &exports {
            match &export.file {
                Some(_) => self.log(job, format!("Exported {} ({} rows)", export.name, export.rows)).await,
                None => self.log(job, format!("Skipped {}: no data source", export.name)).await,
            }
        }

        if let Some(ending) = self.cancelled_before(job, "archive").await? {
            return Ok(ending);
        }
        let built = archive::create_archive(
            work.path(),
            job.id,
            job.started_at,
            &exports,
            policy.encrypt,
            self.encryption_key.as_deref(),
        )
        .await?;
        self.log(
            job,
            format!(
                "Created archive {} ({} bytes, sha256 {})",
                built.name, built.size, built.checksum_sha256
            ),
        )
        .await;

        if let Some(ending) = self.cancelled_before(job, "primary upload").await? {
            return Ok(ending);
        }
        let primary_outcome = self.transfer(job, &primary, &built).await;
        let primary_location = primary_outcome.location.clone();
        let primary_error = primary_outcome.error.clone();
        run.outcomes.push(primary_outcome);
        let Some(primary_location) = primary_location else {
            return Ok(Ending::Failed(format!(
                "Primary upload to '{}' failed: {}",
                primary.destination.name,
                primary_error.unwrap_or_default()
            )));
        };

        if !replicas.is_empty() {
            if let Some(ending) = self.cancelled_before(job, "replication").await? {
                return Ok(ending);
            }
            let parallelism = policy.parallelism.max(1) as usize;
            let pending: Vec<_> = replicas
                .iter()
                .map(|replica| Box::pin(self.transfer(job, replica, &built)))
                .collect();
            let replica_outcomes: Vec<DestinationOutcome> = stream::iter(pending)
                .buffer_unordered(parallelism)
                .collect()
                .await;
            run.outcomes.extend(replica_outcomes);
        }

        let successes = run.success_count();
        let total = run.destination_count;
        self.log(
            job,
            format!("Replication finished: {}/{} destinations succeeded", successes, total),
        )
        .await;

        let required = policy.min_success.max(1) as usize;
        if successes < required {
            return Ok(Ending::Failed(format!(
                "Quorum not met: {} of {} destinations succeeded, {} required",
                successes, total, required
            )));
        }

        let manifest = JobManifest {
            job_id: job.id,
            created_at: Utc::now(),
            archive_name: built.name.clone(),
            archive_size: built.size,
            checksum_sha256: built.checksum_sha256.clone(),
            encrypted: built.encrypted,
            targets: exports,
            files: built.files.clone(),
            destinations: run.outcomes.clone(),
        };
        self.store.save_manifest(&manifest).await?;

        if let Err(e) = work.close() {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to remove scratch directory");
        }

        Ok(Ending::Completed {
            note: format!("Backup stored on {}/{} destinations", successes, total),
            archive: built,
            location: primary_location,
        })
    }

    /// Upload the archive to one destination. Never fails; the outcome
    /// records the error instead.
    async fn transfer(
        &self,
        job: &BackupJob,
        entry: &PolicyDestination,
        built: &BuiltArchive,
    ) -> DestinationOutcome {
        let destination = &entry.destination;
        let role = if entry.is_primary { "primary" } else { "replica" };
        let started = Instant::now();

        let result: Result<ArtifactLocation> = async {
            let adapter = self.adapters.adapter_for(destination).await?;
            adapter.upload(&built.path, &built.name).await
        }
        .await;

        match result {
            Ok(location) => {
                tracing::info!(
                    job_id = %job.id,
                    destination = %destination.name,
                    kind = destination.kind().as_str(),
                    bytes = built.size,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Uploaded archive"
                );
                self.log(job, format!("Uploaded to {} '{}'", role, destination.name))
                    .await;
                DestinationOutcome {
                    name: destination.name.clone(),
                    kind: destination.kind(),
                    is_primary: entry.is_primary,
                    success: true,
                    error: None,
                    location: Some(location),
                }
            }
            Err(e) => {
                let error = describe(&e);
                tracing::warn!(
                    job_id = %job.id,
                    destination = %destination.name,
                    kind = destination.kind().as_str(),
                    error = %error,
                    "Archive upload failed"
                );
                self.log(
                    job,
                    format!("Upload to {} '{}' failed: {}", role, destination.name, error),
                )
                .await;
                DestinationOutcome {
                    name: destination.name.clone(),
                    kind: destination.kind(),
                    is_primary: entry.is_primary,
                    success: false,
                    error: Some(error),
                    location: None,
                }
            }
        }
    }
}

fn describe(e: &AppError) -> String {
    match e {
        AppError::Dependency(msg) | AppError::Storage(msg) => msg.clone(),
        other => other.to_string(),
    }
}
