//! Backup job, manifest, history and restore-request models.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::destination::{DestinationKind, DestinationTarget};
use crate::error::{AppError, Result};

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "backup_job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What created a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "backup_job_trigger", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobTrigger {
    Scheduled,
    Manual,
}

impl JobTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTrigger::Scheduled => "scheduled",
            JobTrigger::Manual => "manual",
        }
    }
}

/// Where the primary copy of an archive landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArtifactLocation {
    Local {
        path: String,
    },
    S3 {
        connection_id: String,
        bucket: String,
        key: String,
    },
    Nextcloud {
        connection_id: String,
        path: String,
    },
    Gdrive {
        connection_id: String,
        file_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
    },
    Remote {
        connection_id: String,
        path: String,
    },
}

impl ArtifactLocation {
    pub fn kind(&self) -> DestinationKind {
        match self {
            ArtifactLocation::Local { .. } => DestinationKind::Local,
            ArtifactLocation::S3 { .. } => DestinationKind::S3,
            ArtifactLocation::Nextcloud { .. } => DestinationKind::Nextcloud,
            ArtifactLocation::Gdrive { .. } => DestinationKind::Gdrive,
            ArtifactLocation::Remote { .. } => DestinationKind::Remote,
        }
    }

    /// File name to present on download.
    pub fn file_name(&self) -> String {
        let path = match self {
            ArtifactLocation::Local { path }
            | ArtifactLocation::Nextcloud { path, .. }
            | ArtifactLocation::Remote { path, .. } => path.as_str(),
            ArtifactLocation::S3 { key, .. } => key.as_str(),
            ArtifactLocation::Gdrive {
                file_name, file_id, ..
            } => return file_name.clone().unwrap_or_else(|| file_id.clone()),
        };
        path.rsplit('/').next().unwrap_or(path).to_string()
    }

    /// A destination that can address this location, used to rebuild an
    /// adapter for download, probe cleanup and prune.
    pub fn as_target(&self) -> DestinationTarget {
        match self {
            ArtifactLocation::Local { path } => DestinationTarget::Local {
                path: parent_dir(path),
            },
            ArtifactLocation::S3 {
                connection_id,
                bucket,
                ..
            } => DestinationTarget::S3 {
                connection_id: connection_id.clone(),
                bucket: Some(bucket.clone()),
                prefix: None,
            },
            ArtifactLocation::Nextcloud {
                connection_id,
                path,
            } => DestinationTarget::Nextcloud {
                connection_id: connection_id.clone(),
                path: parent_dir(path),
            },
            ArtifactLocation::Gdrive { connection_id, .. } => DestinationTarget::Gdrive {
                connection_id: connection_id.clone(),
                subfolder: None,
            },
            ArtifactLocation::Remote {
                connection_id,
                path,
            } => DestinationTarget::Remote {
                connection_id: connection_id.clone(),
                path: parent_dir(path),
            },
        }
    }
}

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// One execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct BackupJob {
    pub id: Uuid,
    pub trigger: JobTrigger,
    pub status: JobStatus,
    pub cancel_requested: bool,
    pub note: Option<String>,
    pub size_bytes: Option<i64>,
    pub duration_sec: Option<f64>,
    pub verified: bool,
    pub artifact_location: Option<ArtifactLocation>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Terminal update written by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFinish {
    pub status: JobStatus,
    pub note: String,
    pub size_bytes: Option<i64>,
    pub duration_sec: f64,
    pub verified: bool,
    pub artifact_location: Option<ArtifactLocation>,
}

impl JobFinish {
    pub fn completed(
        note: impl Into<String>,
        size_bytes: i64,
        duration_sec: f64,
        location: ArtifactLocation,
    ) -> Self {
        Self {
            status: JobStatus::Completed,
            note: note.into(),
            size_bytes: Some(size_bytes),
            duration_sec,
            verified: true,
            artifact_location: Some(location),
        }
    }

    pub fn failed(note: impl Into<String>, duration_sec: f64) -> Self {
        Self {
            status: JobStatus::Failed,
            note: note.into(),
            size_bytes: None,
            duration_sec,
            verified: false,
            artifact_location: None,
        }
    }

    pub fn cancelled(note: impl Into<String>, duration_sec: f64) -> Self {
        Self {
            status: JobStatus::Cancelled,
            note: note.into(),
            size_bytes: None,
            duration_sec,
            verified: false,
            artifact_location: None,
        }
    }
}

/// Per-target export result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TargetExport {
    pub name: String,
    pub rows: u64,
    /// Archive member holding the rows; absent when the target had no data source.
    pub file: Option<String>,
}

/// Outcome of one destination transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DestinationOutcome {
    pub name: String,
    pub kind: DestinationKind,
    pub is_primary: bool,
    pub success: bool,
    pub error: Option<String>,
    pub location: Option<ArtifactLocation>,
}

/// Structured record of what a completed job produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobManifest {
    pub job_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub archive_name: String,
    pub archive_size: u64,
    pub checksum_sha256: String,
    pub encrypted: bool,
    pub targets: Vec<TargetExport>,
    /// Archive member file list.
    pub files: Vec<String>,
    pub destinations: Vec<DestinationOutcome>,
}

/// Status value of a freshly recorded restore request.
pub const RESTORE_REQUESTED: &str = "requested";

/// Recorded intent to restore from a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct RestoreRequest {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: String,
    pub requested_by: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Keyset position in the history listing (start time descending).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryCursor {
    pub started_at: DateTime<Utc>,
    pub id: Uuid,
}

impl HistoryCursor {
    pub fn after(job: &BackupJob) -> Self {
        Self {
            started_at: job.started_at,
            id: job.id,
        }
    }

    /// Opaque page token.
    pub fn encode(&self) -> String {
        let raw = format!("{}:{}", self.started_at.timestamp_micros(), self.id);
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    pub fn decode(token: &str) -> Result<Self> {
        let invalid = || AppError::Validation("invalid history cursor".to_string());
        let raw = URL_SAFE_NO_PAD.decode(token.trim()).map_err(|_| invalid())?;
        let raw = String::from_utf8(raw).map_err(|_| invalid())?;
        let (micros, id) = raw.split_once(':').ok_or_else(invalid)?;
        let micros: i64 = micros.parse().map_err(|_| invalid())?;
        let started_at = Utc.timestamp_micros(micros).single().ok_or_else(invalid)?;
        let id = Uuid::parse_str(id).map_err(|_| invalid())?;
        Ok(Self { started_at, id })
    }

    /// Whether `job` sorts strictly after this cursor in start time descending order.
    pub fn precedes(&self, job: &BackupJob) -> bool {
        (job.started_at, job.id) < (self.started_at, self.id)
    }
}

/// History query.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub status: Option<JobStatus>,
    /// Free text matched against job id and note.
    pub q: Option<String>,
    /// Inclusive lower bound on start time.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on start time.
    pub to: Option<DateTime<Utc>>,
    pub cursor: Option<HistoryCursor>,
    pub limit: i64,
}

impl HistoryFilter {
    /// In-process evaluation of the status/search/date predicates.
    pub fn matches(&self, job: &BackupJob) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(from) = self.from {
            if job.started_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if job.started_at > to {
                return false;
            }
        }
        if let Some(q) = self.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let q = q.to_lowercase();
            let in_id = job.id.to_string().contains(&q);
            let in_note = job
                .note
                .as_deref()
                .map(|n| n.to_lowercase().contains(&q))
                .unwrap_or(false);
            if !in_id && !in_note {
                return false;
            }
        }
        if let Some(cursor) = &self.cursor {
            if !cursor.precedes(job) {
                return false;
            }
        }
        true
    }
}

/// One page of history.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HistoryPage {
    pub items: Vec<BackupJob>,
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_at(ts: i64) -> BackupJob {
        BackupJob {
            id: Uuid::new_v4(),
            trigger: JobTrigger::Manual,
            status: JobStatus::Completed,
            cancel_requested: false,
            note: Some("Backup completed: 3/3 destinations".into()),
            size_bytes: Some(10),
            duration_sec: Some(1.0),
            verified: true,
            artifact_location: None,
            started_at: Utc.timestamp_opt(ts, 0).unwrap(),
            finished_at: None,
        }
    }

    #[test]
    fn test_cursor_token_roundtrip() {
        let job = job_at(1_700_000_000);
        let cursor = HistoryCursor::after(&job);
        let decoded = HistoryCursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(HistoryCursor::decode("not a cursor").is_err());
        assert!(HistoryCursor::decode(&URL_SAFE_NO_PAD.encode("123")).is_err());
    }

    #[test]
    fn test_cursor_precedes_older_jobs_only() {
        let newer = job_at(2_000);
        let older = job_at(1_000);
        let cursor = HistoryCursor::after(&newer);
        assert!(cursor.precedes(&older));
        assert!(!cursor.precedes(&newer));
    }

    #[test]
    fn test_filter_date_range_is_inclusive() {
        let job = job_at(1_000);
        let filter = HistoryFilter {
            from: Some(job.started_at),
            to: Some(job.started_at),
            ..Default::default()
        };
        assert!(filter.matches(&job));
    }

    #[test]
    fn test_filter_search_matches_note_case_insensitively() {
        let job = job_at(1_000);
        let filter = HistoryFilter {
            q: Some("DESTINATIONS".into()),
            ..Default::default()
        };
        assert!(filter.matches(&job));
        let filter = HistoryFilter {
            q: Some("quorum".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&job));
    }

    #[test]
    fn test_location_file_name_and_parent() {
        let loc = ArtifactLocation::Remote {
            connection_id: "sftp".into(),
            path: "/srv/backups/backup-1.tar.gz".into(),
        };
        assert_eq!(loc.file_name(), "backup-1.tar.gz");
        assert_eq!(
            loc.as_target(),
            DestinationTarget::Remote {
                connection_id: "sftp".into(),
                path: "/srv/backups".into()
            }
        );
    }
}
