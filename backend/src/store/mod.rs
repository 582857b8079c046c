//! Persistence seam for the backup engine.
//!
//! [`BackupStore`] owns policy, destination, job, log, manifest and restore
//! records of one organization. [`ConnectionStore`] is a read-only view of
//! the external credential store and [`DataExporter`] exports a named data
//! domain as JSON lines. Postgres implementations back production; the
//! in-memory ones back tests and database-less runs.

pub mod memory;
pub mod postgres;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::connection::StorageConnection;
use crate::models::destination::PolicyDestination;
use crate::models::job::{
    BackupJob, HistoryCursor, HistoryFilter, HistoryPage, JobFinish, JobManifest, JobTrigger,
    RestoreRequest,
};
use crate::models::policy::{BackupPolicy, StoredPolicy};

pub use memory::{MemoryBackupStore, MemoryConnectionStore, MemoryDataExporter};
pub use postgres::{PgBackupStore, PgConnectionStore, PgDataExporter};

/// Note written on jobs cancelled before the worker picked them up.
pub const CANCELLED_BEFORE_START: &str = "Cancelled before processing started";

/// Policy, job and artifact metadata persistence.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Load the organization's policy with its ordered destination list.
    async fn get_policy(&self) -> Result<Option<StoredPolicy>>;

    /// Persist a validated policy and rewrite its destination join set in
    /// one unit. Destinations are upserted by name.
    async fn save_policy(
        &self,
        policy: &BackupPolicy,
        destinations: &[PolicyDestination],
    ) -> Result<StoredPolicy>;

    /// Set `last_scheduled_at = now` unless it was already set within
    /// `debounce` of `now`. Returns whether the marker was written.
    async fn mark_scheduled_once(&self, now: DateTime<Utc>, debounce: Duration) -> Result<bool>;

    /// Create a running job with a snapshot of the policy's current
    /// destinations.
    async fn create_job(&self, trigger: JobTrigger) -> Result<BackupJob>;

    async fn get_job(&self, id: Uuid) -> Result<Option<BackupJob>>;

    /// Oldest running job without a cancellation request.
    async fn next_runnable_job(&self) -> Result<Option<BackupJob>>;

    /// The destination snapshot taken when the job was created.
    async fn job_destinations(&self, id: Uuid) -> Result<Vec<PolicyDestination>>;

    /// Move running jobs flagged for cancellation to `cancelled`.
    async fn sweep_cancelled(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Write the terminal state of a running job. Returns false if the job
    /// was no longer running.
    async fn finish_job(&self, id: Uuid, finish: &JobFinish) -> Result<bool>;

    /// Flag a running job for cancellation. Returns false if it is not running.
    async fn request_cancel(&self, id: Uuid) -> Result<bool>;

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool>;

    /// Reset a failed job to running. Returns false if it is not failed.
    async fn reset_for_retry(&self, id: Uuid) -> Result<bool>;

    /// Append one line to the job log.
    async fn append_log(&self, id: Uuid, line: &str) -> Result<()>;

    async fn get_log(&self, id: Uuid) -> Result<Option<String>>;

    async fn save_manifest(&self, manifest: &JobManifest) -> Result<()>;

    async fn get_manifest(&self, id: Uuid) -> Result<Option<JobManifest>>;

    /// Jobs by start time descending, keyset paginated.
    async fn list_history(&self, filter: &HistoryFilter) -> Result<HistoryPage>;

    /// Delete terminal jobs started at or before `cutoff`, with their
    /// snapshots, logs, manifests and restore requests. Returns the deleted jobs.
    async fn prune_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackupJob>>;

    async fn create_restore_request(
        &self,
        job_id: Uuid,
        requested_by: Option<String>,
        note: Option<String>,
    ) -> Result<RestoreRequest>;

    /// Health check.
    async fn ping(&self) -> Result<()>;
}

/// Read-only access to storage connections.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<StorageConnection>>;
}

/// Exports a logical data domain to a JSON-lines file.
#[async_trait]
pub trait DataExporter: Send + Sync {
    /// Write one JSON object per line to `out`. Returns the row count, or
    /// `None` when no data source backs the target.
    async fn export(&self, target: &str, out: &Path) -> Result<Option<u64>>;
}

/// Current time at the precision the database keeps.
pub(crate) fn db_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Build a page from rows fetched with `limit + 1`.
pub(crate) fn into_page(mut rows: Vec<BackupJob>, limit: i64) -> HistoryPage {
    let limit = limit.max(1) as usize;
    let next_cursor = if rows.len() > limit {
        rows.truncate(limit);
        rows.last().map(|job| HistoryCursor::after(job).encode())
    } else {
        None
    };
    HistoryPage {
        items: rows,
        next_cursor,
    }
}

/// Whether `name` can be used as an unquoted SQL identifier.
pub(crate) fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
