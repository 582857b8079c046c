//! In-process store implementations.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{db_now, into_page, BackupStore, ConnectionStore, DataExporter, CANCELLED_BEFORE_START};
use crate::error::{AppError, Result};
use crate::models::connection::StorageConnection;
use crate::models::destination::PolicyDestination;
use crate::models::job::{
    BackupJob, HistoryFilter, HistoryPage, JobFinish, JobManifest, JobStatus, JobTrigger,
    RestoreRequest, RESTORE_REQUESTED,
};
use crate::models::policy::{BackupPolicy, StoredPolicy};

struct JobRecord {
    job: BackupJob,
    destinations: Vec<PolicyDestination>,
    log: String,
    manifest: Option<JobManifest>,
}

#[derive(Default)]
struct State {
    policy: Option<StoredPolicy>,
    jobs: HashMap<Uuid, JobRecord>,
    restores: Vec<RestoreRequest>,
}

/// [`BackupStore`] kept in process memory.
#[derive(Default)]
pub struct MemoryBackupStore {
    state: RwLock<State>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a job's start time. Used to age jobs in tests.
    pub async fn set_started_at(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let record = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("backup job {}", id)))?;
        record.job.started_at = started_at;
        Ok(())
    }

    pub async fn restore_requests(&self) -> Vec<RestoreRequest> {
        self.state.read().await.restores.clone()
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn get_policy(&self) -> Result<Option<StoredPolicy>> {
        Ok(self.state.read().await.policy.clone())
    }

    async fn save_policy(
        &self,
        policy: &BackupPolicy,
        destinations: &[PolicyDestination],
    ) -> Result<StoredPolicy> {
        let mut state = self.state.write().await;
        let last_scheduled_at = state
            .policy
            .as_ref()
            .and_then(|p| p.policy.last_scheduled_at);

        let mut policy = policy.clone();
        policy.last_scheduled_at = last_scheduled_at;
        policy.updated_at = Some(db_now());

        let stored = StoredPolicy {
            policy,
            destinations: destinations.to_vec(),
        };
        state.policy = Some(stored.clone());
        Ok(stored)
    }

    async fn mark_scheduled_once(&self, now: DateTime<Utc>, debounce: Duration) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(stored) = state.policy.as_mut() else {
            return Ok(false);
        };
        let debounce = chrono::Duration::from_std(debounce)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let allowed = match stored.policy.last_scheduled_at {
            None => true,
            Some(last) => last < now - debounce,
        };
        if allowed {
            stored.policy.last_scheduled_at = Some(now);
        }
        Ok(allowed)
    }

    async fn create_job(&self, trigger: JobTrigger) -> Result<BackupJob> {
        let mut state = self.state.write().await;
        let stored = state
            .policy
            .as_ref()
            .ok_or_else(|| AppError::Validation("no backup policy has been configured".into()))?;
        if stored.primary().is_none() {
            return Err(AppError::Validation(
                "backup policy has no primary destination".into(),
            ));
        }
        let destinations = stored.destinations.clone();

        let job = BackupJob {
            id: Uuid::new_v4(),
            trigger,
            status: JobStatus::Running,
            cancel_requested: false,
            note: None,
            size_bytes: None,
            duration_sec: None,
            verified: false,
            artifact_location: None,
            started_at: db_now(),
            finished_at: None,
        };
        state.jobs.insert(
            job.id,
            JobRecord {
                job: job.clone(),
                destinations,
                log: String::new(),
                manifest: None,
            },
        );
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<BackupJob>> {
        Ok(self.state.read().await.jobs.get(&id).map(|r| r.job.clone()))
    }

    async fn next_runnable_job(&self) -> Result<Option<BackupJob>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .map(|r| &r.job)
            .filter(|j| j.status == JobStatus::Running && !j.cancel_requested)
            .min_by_key(|j| (j.started_at, j.id))
            .cloned())
    }

    async fn job_destinations(&self, id: Uuid) -> Result<Vec<PolicyDestination>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .get(&id)
            .map(|r| r.destinations.clone())
            .unwrap_or_default())
    }

    async fn sweep_cancelled(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut state = self.state.write().await;
        let mut swept = Vec::new();
        for record in state.jobs.values_mut() {
            let job = &mut record.job;
            if job.status == JobStatus::Running && job.cancel_requested {
                job.status = JobStatus::Cancelled;
                job.finished_at = Some(now);
                job.note = Some(CANCELLED_BEFORE_START.to_string());
                swept.push(job.id);
            }
        }
        Ok(swept)
    }

    async fn finish_job(&self, id: Uuid, finish: &JobFinish) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(record) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        let job = &mut record.job;
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.status = finish.status;
        job.note = Some(finish.note.clone());
        job.size_bytes = finish.size_bytes;
        job.duration_sec = Some(finish.duration_sec);
        job.verified = finish.verified;
        job.artifact_location = finish.artifact_location.clone();
        job.finished_at = Some(db_now());
        Ok(true)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(record) if record.job.status == JobStatus::Running => {
                record.job.cancel_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .get(&id)
            .map(|r| r.job.cancel_requested)
            .unwrap_or(false))
    }

    async fn reset_for_retry(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(record) if record.job.status == JobStatus::Failed => {
                let job = &mut record.job;
                job.status = JobStatus::Running;
                job.cancel_requested = false;
                job.finished_at = None;
                job.note = Some("Retry requested".to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_log(&self, id: Uuid, line: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(record) = state.jobs.get_mut(&id) {
            record.log.push_str(line);
            record.log.push('\n');
        }
        Ok(())
    }

    async fn get_log(&self, id: Uuid) -> Result<Option<String>> {
        Ok(self.state.read().await.jobs.get(&id).map(|r| r.log.clone()))
    }

    async fn save_manifest(&self, manifest: &JobManifest) -> Result<()> {
        let mut state = self.state.write().await;
        let record = state
            .jobs
            .get_mut(&manifest.job_id)
            .ok_or_else(|| AppError::NotFound(format!("backup job {}", manifest.job_id)))?;
        record.manifest = Some(manifest.clone());
        Ok(())
    }

    async fn get_manifest(&self, id: Uuid) -> Result<Option<JobManifest>> {
        let state = self.state.read().await;
        Ok(state.jobs.get(&id).and_then(|r| r.manifest.clone()))
    }

    async fn list_history(&self, filter: &HistoryFilter) -> Result<HistoryPage> {
        let state = self.state.read().await;
        let mut rows: Vec<BackupJob> = state
            .jobs
            .values()
            .map(|r| &r.job)
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.started_at, b.id).cmp(&(a.started_at, a.id)));
        rows.truncate(filter.limit.max(1) as usize + 1);
        Ok(into_page(rows, filter.limit))
    }

    async fn prune_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackupJob>> {
        let mut state = self.state.write().await;
        let doomed: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|r| r.job.status.is_terminal() && r.job.started_at <= cutoff)
            .map(|r| r.job.id)
            .collect();

        let mut pruned = Vec::with_capacity(doomed.len());
        for id in doomed {
            if let Some(record) = state.jobs.remove(&id) {
                pruned.push(record.job);
            }
        }
        state
            .restores
            .retain(|r| !pruned.iter().any(|job| job.id == r.job_id));
        Ok(pruned)
    }

    async fn create_restore_request(
        &self,
        job_id: Uuid,
        requested_by: Option<String>,
        note: Option<String>,
    ) -> Result<RestoreRequest> {
        let mut state = self.state.write().await;
        if !state.jobs.contains_key(&job_id) {
            return Err(AppError::NotFound(format!("backup job {}", job_id)));
        }
        let request = RestoreRequest {
            id: Uuid::new_v4(),
            job_id,
            status: RESTORE_REQUESTED.to_string(),
            requested_by,
            note,
            created_at: db_now(),
        };
        state.restores.push(request.clone());
        Ok(request)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// [`ConnectionStore`] over a fixed map of connections.
#[derive(Default)]
pub struct MemoryConnectionStore {
    connections: RwLock<HashMap<String, StorageConnection>>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, connection: StorageConnection) {
        self.connections
            .write()
            .await
            .insert(connection.id.clone(), connection);
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn get(&self, id: &str) -> Result<Option<StorageConnection>> {
        Ok(self.connections.read().await.get(id).cloned())
    }
}

/// [`DataExporter`] over in-memory row sets keyed by target name.
#[derive(Default)]
pub struct MemoryDataExporter {
    tables: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryDataExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_rows(&self, target: &str, rows: Vec<Value>) {
        self.tables.write().await.insert(target.to_string(), rows);
    }
}

#[async_trait]
impl DataExporter for MemoryDataExporter {
    async fn export(&self, target: &str, out: &Path) -> Result<Option<u64>> {
        let tables = self.tables.read().await;
        let Some(rows) = tables.get(target) else {
            return Ok(None);
        };

        let mut file = tokio::fs::File::create(out).await?;
        for row in rows {
            let mut line = serde_json::to_vec(row)?;
            line.push(b'\n');
            file.write_all(&line).await?;
        }
        file.flush().await?;
        Ok(Some(rows.len() as u64))
    }
}
