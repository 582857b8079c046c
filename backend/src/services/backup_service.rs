//! Control operations over backup jobs: manual runs, retry, cancel, prune,
//! destination probes, restore requests and artifact access.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::destination::{Destination, DestinationRole};
use crate::models::job::{
    BackupJob, HistoryFilter, HistoryPage, JobManifest, JobStatus, JobTrigger, RestoreRequest,
};
use crate::services::backup_worker::BackupWorker;
use crate::services::metrics_service;
use crate::services::schedule::{CompiledSchedule, MAX_PREVIEW};
use crate::storage::{self, AdapterFactory, ArtifactDownload, ProbeReport};
use crate::store::BackupStore;

const DEFAULT_PREVIEW: usize = 5;

/// Capability flags for the UI.
#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
pub struct BackupPermissions {
    pub can_restore: bool,
    pub can_download: bool,
}

/// Result of a retention sweep.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct PruneReport {
    pub pruned: u64,
    pub job_ids: Vec<Uuid>,
    pub cutoff: Option<DateTime<Utc>>,
    /// Remote archives deleted (only when remote pruning is enabled).
    pub remote_deleted: u64,
    pub remote_errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct RestoreInput {
    pub requested_by: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SchedulePreview {
    pub expression: String,
    pub timezone: String,
    pub next_runs: Vec<DateTime<Utc>>,
}

/// Settings of the control facade taken from the environment.
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub default_retention_days: i32,
    pub prune_remote_artifacts: bool,
    pub allow_restore: bool,
    pub allow_download: bool,
}

pub struct BackupService {
    store: Arc<dyn BackupStore>,
    adapters: Arc<dyn AdapterFactory>,
    worker: Arc<BackupWorker>,
    settings: ControlSettings,
}

impl BackupService {
    pub fn new(
        store: Arc<dyn BackupStore>,
        adapters: Arc<dyn AdapterFactory>,
        worker: Arc<BackupWorker>,
        settings: ControlSettings,
    ) -> Self {
        Self {
            store,
            adapters,
            worker,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn BackupStore> {
        &self.store
    }

    pub fn worker_busy(&self) -> bool {
        self.worker.is_busy()
    }

    pub fn permissions(&self) -> BackupPermissions {
        BackupPermissions {
            can_restore: self.settings.allow_restore,
            can_download: self.settings.allow_download,
        }
    }

    async fn require_job(&self, id: Uuid) -> Result<BackupJob> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("backup job {}", id)))
    }

    pub async fn get_job(&self, id: Uuid) -> Result<BackupJob> {
        self.require_job(id).await
    }

    /// Enqueue a manual backup and wake the worker.
    pub async fn run_now(&self) -> Result<BackupJob> {
        let job = self.store.create_job(JobTrigger::Manual).await?;
        tracing::info!(job_id = %job.id, "Manual backup job created");
        self.worker.trigger();
        Ok(job)
    }

    /// Put a failed job back in the queue.
    pub async fn retry(&self, id: Uuid) -> Result<BackupJob> {
        let job = self.require_job(id).await?;
        if job.status != JobStatus::Failed {
            return Err(AppError::Conflict(format!(
                "only failed jobs can be retried, job {} is {}",
                id, job.status
            )));
        }
        if !self.store.reset_for_retry(id).await? {
            return Err(AppError::Conflict(format!("job {} is no longer failed", id)));
        }
        tracing::info!(job_id = %id, "Backup job queued for retry");
        self.worker.trigger();
        self.require_job(id).await
    }

    /// Request cooperative cancellation of a running job.
    pub async fn cancel(&self, id: Uuid) -> Result<BackupJob> {
        let job = self.require_job(id).await?;
        if job.status != JobStatus::Running {
            return Err(AppError::Conflict(format!(
                "only running jobs can be cancelled, job {} is {}",
                id, job.status
            )));
        }
        if !self.store.request_cancel(id).await? {
            return Err(AppError::Conflict(format!("job {} is no longer running", id)));
        }
        tracing::info!(job_id = %id, "Cancellation requested");
        // An idle worker moves a job that never started straight to cancelled.
        self.worker.trigger();
        self.require_job(id).await
    }

    /// Delete terminal jobs older than the retention period.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<PruneReport> {
        let retention_days = match self.store.get_policy().await? {
            Some(stored) => stored.policy.retention_days,
            None => self.settings.default_retention_days,
        };
        let cutoff = now - chrono::Duration::days(i64::from(retention_days));
        let pruned = self.store.prune_jobs(cutoff).await?;

        let mut report = PruneReport {
            pruned: pruned.len() as u64,
            job_ids: pruned.iter().map(|j| j.id).collect(),
            cutoff: Some(cutoff),
            ..PruneReport::default()
        };

        if self.settings.prune_remote_artifacts {
            for job in &pruned {
                let Some(location) = &job.artifact_location else {
                    continue;
                };
                let result = async {
                    let adapter = self.adapters.adapter_for_location(location).await?;
                    adapter.delete(location).await
                }
                .await;
                match result {
                    Ok(()) => report.remote_deleted += 1,
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "Failed to delete pruned archive");
                        report.remote_errors.push(format!("{}: {}", job.id, e));
                    }
                }
            }
        }

        metrics_service::record_prune(report.pruned);
        tracing::info!(
            pruned = report.pruned,
            retention_days,
            cutoff = %cutoff,
            "Pruned backup history"
        );
        Ok(report)
    }

    /// Write, read back and delete a marker object without saving anything.
    pub async fn test_destination(&self, destination: &Destination) -> Result<ProbeReport> {
        destination.validate(DestinationRole::Replica)?;
        let adapter = match self.adapters.adapter_for(destination).await {
            Ok(adapter) => adapter,
            Err(e) => return Ok(ProbeReport::failed(e.to_string())),
        };
        let report = storage::probe(adapter.as_ref()).await;
        tracing::info!(
            destination = %destination.name,
            kind = destination.kind().as_str(),
            ok = report.ok(),
            "Destination probe finished"
        );
        Ok(report)
    }

    /// Record the intent to restore from a completed job.
    pub async fn restore(&self, id: Uuid, input: RestoreInput) -> Result<RestoreRequest> {
        if !self.settings.allow_restore {
            return Err(AppError::Authorization("restore is not permitted".into()));
        }
        let job = self.require_job(id).await?;
        if job.status != JobStatus::Completed {
            return Err(AppError::Conflict(format!(
                "only completed jobs can be restored, job {} is {}",
                id, job.status
            )));
        }
        let request = self
            .store
            .create_restore_request(id, input.requested_by, input.note)
            .await?;
        tracing::info!(job_id = %id, restore_id = %request.id, "Restore requested");
        Ok(request)
    }

    /// Bytes or a presigned redirect for the primary archive of a completed job.
    pub async fn download(&self, id: Uuid) -> Result<ArtifactDownload> {
        if !self.settings.allow_download {
            return Err(AppError::Authorization("download is not permitted".into()));
        }
        let job = self.require_job(id).await?;
        if job.status != JobStatus::Completed {
            return Err(AppError::Conflict(format!(
                "only completed jobs can be downloaded, job {} is {}",
                id, job.status
            )));
        }
        let location = job.artifact_location.ok_or_else(|| {
            AppError::NotFound(format!("backup job {} has no artifact location", id))
        })?;
        let adapter = self.adapters.adapter_for_location(&location).await?;
        adapter.download(&location).await
    }

    pub async fn log(&self, id: Uuid) -> Result<String> {
        self.require_job(id).await?;
        Ok(self.store.get_log(id).await?.unwrap_or_default())
    }

    pub async fn manifest(&self, id: Uuid) -> Result<JobManifest> {
        self.store
            .get_manifest(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("manifest for backup job {}", id)))
    }

    pub async fn history(&self, filter: &HistoryFilter) -> Result<HistoryPage> {
        self.store.list_history(filter).await
    }

    /// Upcoming runs of the saved schedule.
    pub async fn schedule_preview(
        &self,
        count: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<SchedulePreview> {
        let count = count.unwrap_or(DEFAULT_PREVIEW);
        if count == 0 || count > MAX_PREVIEW {
            return Err(AppError::Validation(format!(
                "count must be between 1 and {}",
                MAX_PREVIEW
            )));
        }
        let stored = self
            .store
            .get_policy()
            .await?
            .ok_or_else(|| AppError::NotFound("backup policy".into()))?;
        let schedule = CompiledSchedule::from_policy(&stored.policy)?;
        Ok(SchedulePreview {
            expression: schedule.expression().to_string(),
            timezone: stored.policy.timezone.clone(),
            next_runs: schedule.next_n(now, count),
        })
    }
}
