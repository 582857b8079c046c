//! Postgres store implementations.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

use super::{
    db_now, into_page, is_safe_identifier, BackupStore, ConnectionStore, DataExporter,
    CANCELLED_BEFORE_START,
};
use crate::error::{AppError, Result};
use crate::models::connection::{ConnectionKind, StorageConnection};
use crate::models::destination::{Destination, DestinationTarget, PolicyDestination};
use crate::models::job::{
    ArtifactLocation, BackupJob, HistoryFilter, HistoryPage, JobFinish, JobManifest, JobStatus,
    JobTrigger, RestoreRequest, RESTORE_REQUESTED,
};
use crate::models::policy::{BackupPolicy, NotificationChannels, ScheduleKind, StoredPolicy};

const JOB_COLUMNS: &str = "id, trigger, status, cancel_requested, note, size_bytes, \
     duration_sec, verified, artifact_location, started_at, finished_at";

/// Tables never exported as backup targets.
const RESTRICTED_TABLES: &[&str] = &["storage_connections", "_sqlx_migrations"];

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    trigger: JobTrigger,
    status: JobStatus,
    cancel_requested: bool,
    note: Option<String>,
    size_bytes: Option<i64>,
    duration_sec: Option<f64>,
    verified: bool,
    artifact_location: Option<Json<ArtifactLocation>>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<JobRow> for BackupJob {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            trigger: row.trigger,
            status: row.status,
            cancel_requested: row.cancel_requested,
            note: row.note,
            size_bytes: row.size_bytes,
            duration_sec: row.duration_sec,
            verified: row.verified,
            artifact_location: row.artifact_location.map(|j| j.0),
            started_at: row.started_at,
            finished_at: row.finished_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: Uuid,
    enabled: bool,
    targets: Vec<String>,
    schedule: String,
    cron_expression: Option<String>,
    timezone: String,
    run_hour: i32,
    run_weekday: i32,
    retention_days: i32,
    encrypt: bool,
    notify_email: bool,
    notify_chat: bool,
    notify_webhook: bool,
    min_success: i32,
    parallelism: i32,
    last_scheduled_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl PolicyRow {
    fn into_policy(self) -> Result<BackupPolicy> {
        let schedule = ScheduleKind::parse(&self.schedule).ok_or_else(|| {
            AppError::Internal(format!("stored schedule '{}' is not recognized", self.schedule))
        })?;
        Ok(BackupPolicy {
            enabled: self.enabled,
            targets: self.targets,
            schedule,
            cron_expression: self.cron_expression,
            timezone: self.timezone,
            run_hour: self.run_hour,
            run_weekday: self.run_weekday,
            retention_days: self.retention_days,
            encrypt: self.encrypt,
            notifications: NotificationChannels {
                email: self.notify_email,
                chat: self.notify_chat,
                webhook: self.notify_webhook,
            },
            min_success: self.min_success,
            parallelism: self.parallelism,
            last_scheduled_at: self.last_scheduled_at,
            updated_at: Some(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct DestinationRow {
    name: String,
    spec: Json<DestinationTarget>,
    is_primary: bool,
    priority: i32,
}

impl From<DestinationRow> for PolicyDestination {
    fn from(row: DestinationRow) -> Self {
        Self {
            destination: Destination::new(row.name, row.spec.0),
            is_primary: row.is_primary,
            priority: row.priority,
        }
    }
}

async fn load_policy_destinations<'e, E>(executor: E, policy_id: Uuid) -> Result<Vec<PolicyDestination>>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows: Vec<DestinationRow> = sqlx::query_as(
        r#"
        SELECT d.name, d.spec, pd.is_primary, pd.priority
        FROM backup_policy_destinations pd
        JOIN backup_destinations d ON d.id = pd.destination_id
        WHERE pd.policy_id = $1
        ORDER BY pd.is_primary DESC, pd.priority, d.name
        "#,
    )
    .bind(policy_id)
    .fetch_all(executor)
    .await
    .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// [`BackupStore`] over Postgres, scoped to one organization.
pub struct PgBackupStore {
    db: PgPool,
    organization_id: String,
}

impl PgBackupStore {
    pub fn new(db: PgPool, organization_id: impl Into<String>) -> Self {
        Self {
            db,
            organization_id: organization_id.into(),
        }
    }
}

#[async_trait]
impl BackupStore for PgBackupStore {
    async fn get_policy(&self) -> Result<Option<StoredPolicy>> {
        let row: Option<PolicyRow> = sqlx::query_as(
            r#"
            SELECT id, enabled, targets, schedule, cron_expression, timezone, run_hour,
                   run_weekday, retention_days, encrypt, notify_email, notify_chat,
                   notify_webhook, min_success, parallelism, last_scheduled_at, updated_at
            FROM backup_policies
            WHERE organization_id = $1
            "#,
        )
        .bind(&self.organization_id)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let destinations = load_policy_destinations(&self.db, row.id).await?;
        Ok(Some(StoredPolicy {
            policy: row.into_policy()?,
            destinations,
        }))
    }

    async fn save_policy(
        &self,
        policy: &BackupPolicy,
        destinations: &[PolicyDestination],
    ) -> Result<StoredPolicy> {
        let mut tx = self.db.begin().await?;

        let policy_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO backup_policies (
                id, organization_id, enabled, targets, schedule, cron_expression, timezone,
                run_hour, run_weekday, retention_days, encrypt, notify_email, notify_chat,
                notify_webhook, min_success, parallelism
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (organization_id) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                targets = EXCLUDED.targets,
                schedule = EXCLUDED.schedule,
                cron_expression = EXCLUDED.cron_expression,
                timezone = EXCLUDED.timezone,
                run_hour = EXCLUDED.run_hour,
                run_weekday = EXCLUDED.run_weekday,
                retention_days = EXCLUDED.retention_days,
                encrypt = EXCLUDED.encrypt,
                notify_email = EXCLUDED.notify_email,
                notify_chat = EXCLUDED.notify_chat,
                notify_webhook = EXCLUDED.notify_webhook,
                min_success = EXCLUDED.min_success,
                parallelism = EXCLUDED.parallelism,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&self.organization_id)
        .bind(policy.enabled)
        .bind(&policy.targets)
        .bind(policy.schedule.as_str())
        .bind(&policy.cron_expression)
        .bind(&policy.timezone)
        .bind(policy.run_hour)
        .bind(policy.run_weekday)
        .bind(policy.retention_days)
        .bind(policy.encrypt)
        .bind(policy.notifications.email)
        .bind(policy.notifications.chat)
        .bind(policy.notifications.webhook)
        .bind(policy.min_success)
        .bind(policy.parallelism)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM backup_policy_destinations WHERE policy_id = $1")
            .bind(policy_id)
            .execute(&mut *tx)
            .await?;

        for entry in destinations {
            let destination_id: Uuid = sqlx::query_scalar(
                r#"
                INSERT INTO backup_destinations (id, organization_id, name, kind, spec)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (organization_id, name) DO UPDATE SET
                    kind = EXCLUDED.kind,
                    spec = EXCLUDED.spec,
                    updated_at = NOW()
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&self.organization_id)
            .bind(&entry.destination.name)
            .bind(entry.destination.kind().as_str())
            .bind(Json(&entry.destination.target))
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO backup_policy_destinations (policy_id, destination_id, is_primary, priority)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(policy_id)
            .bind(destination_id)
            .bind(entry.is_primary)
            .bind(entry.priority)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.get_policy()
            .await?
            .ok_or_else(|| AppError::Internal("saved policy could not be reloaded".into()))
    }

    async fn mark_scheduled_once(&self, now: DateTime<Utc>, debounce: Duration) -> Result<bool> {
        let debounce = chrono::Duration::from_std(debounce)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let result = sqlx::query(
            r#"
            UPDATE backup_policies
            SET last_scheduled_at = $2
            WHERE organization_id = $1
              AND (last_scheduled_at IS NULL OR last_scheduled_at < $3)
            "#,
        )
        .bind(&self.organization_id)
        .bind(now)
        .bind(now - debounce)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn create_job(&self, trigger: JobTrigger) -> Result<BackupJob> {
        let mut tx = self.db.begin().await?;

        let policy_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM backup_policies WHERE organization_id = $1 FOR SHARE",
        )
        .bind(&self.organization_id)
        .fetch_optional(&mut *tx)
        .await?;
        let policy_id = policy_id
            .ok_or_else(|| AppError::Validation("no backup policy has been configured".into()))?;

        let destinations = load_policy_destinations(&mut *tx, policy_id).await?;
        if !destinations.iter().any(|d| d.is_primary) {
            return Err(AppError::Validation(
                "backup policy has no primary destination".into(),
            ));
        }

        let row: JobRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO backup_jobs (id, organization_id, trigger, status, started_at)
            VALUES ($1, $2, $3, 'running', $4)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&self.organization_id)
        .bind(trigger)
        .bind(db_now())
        .fetch_one(&mut *tx)
        .await?;

        for (position, entry) in destinations.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO backup_job_destinations (job_id, position, name, destination, is_primary, priority)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(row.id)
            .bind(position as i32)
            .bind(&entry.destination.name)
            .bind(Json(&entry.destination.target))
            .bind(entry.is_primary)
            .bind(entry.priority)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(row.into())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<BackupJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM backup_jobs WHERE id = $1 AND organization_id = $2"
        ))
        .bind(id)
        .bind(&self.organization_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn next_runnable_job(&self) -> Result<Option<BackupJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM backup_jobs
            WHERE organization_id = $1 AND status = 'running' AND NOT cancel_requested
            ORDER BY started_at, id
            LIMIT 1
            "#
        ))
        .bind(&self.organization_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn job_destinations(&self, id: Uuid) -> Result<Vec<PolicyDestination>> {
        let rows: Vec<DestinationRow> = sqlx::query_as(
            r#"
            SELECT name, destination AS spec, is_primary, priority
            FROM backup_job_destinations
            WHERE job_id = $1
            ORDER BY position
            "#,
        )
        .bind(id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn sweep_cancelled(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE backup_jobs
            SET status = 'cancelled', finished_at = $2, note = $3
            WHERE organization_id = $1 AND status = 'running' AND cancel_requested
            RETURNING id
            "#,
        )
        .bind(&self.organization_id)
        .bind(now)
        .bind(CANCELLED_BEFORE_START)
        .fetch_all(&self.db)
        .await?;
        Ok(ids)
    }

    async fn finish_job(&self, id: Uuid, finish: &JobFinish) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE backup_jobs
            SET status = $3, note = $4, size_bytes = $5, duration_sec = $6,
                verified = $7, artifact_location = $8, finished_at = $9
            WHERE id = $1 AND organization_id = $2 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(&self.organization_id)
        .bind(finish.status)
        .bind(&finish.note)
        .bind(finish.size_bytes)
        .bind(finish.duration_sec)
        .bind(finish.verified)
        .bind(finish.artifact_location.as_ref().map(Json))
        .bind(db_now())
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE backup_jobs SET cancel_requested = TRUE
            WHERE id = $1 AND organization_id = $2 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(&self.organization_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM backup_jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;
        Ok(flag.unwrap_or(false))
    }

    async fn reset_for_retry(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE backup_jobs
            SET status = 'running', cancel_requested = FALSE, finished_at = NULL,
                note = 'Retry requested'
            WHERE id = $1 AND organization_id = $2 AND status = 'failed'
            "#,
        )
        .bind(id)
        .bind(&self.organization_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_log(&self, id: Uuid, line: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_job_logs (job_id, content)
            VALUES ($1, $2)
            ON CONFLICT (job_id) DO UPDATE SET
                content = backup_job_logs.content || EXCLUDED.content,
                updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(format!("{}\n", line))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_log(&self, id: Uuid) -> Result<Option<String>> {
        let content: Option<String> =
            sqlx::query_scalar("SELECT content FROM backup_job_logs WHERE job_id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;
        Ok(content)
    }

    async fn save_manifest(&self, manifest: &JobManifest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_job_manifests (job_id, manifest)
            VALUES ($1, $2)
            ON CONFLICT (job_id) DO UPDATE SET manifest = EXCLUDED.manifest
            "#,
        )
        .bind(manifest.job_id)
        .bind(Json(manifest))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_manifest(&self, id: Uuid) -> Result<Option<JobManifest>> {
        let manifest: Option<Json<JobManifest>> =
            sqlx::query_scalar("SELECT manifest FROM backup_job_manifests WHERE job_id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;
        Ok(manifest.map(|m| m.0))
    }

    async fn list_history(&self, filter: &HistoryFilter) -> Result<HistoryPage> {
        let q = filter
            .q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);

        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM backup_jobs
            WHERE organization_id = $1
              AND ($2::backup_job_status IS NULL OR status = $2)
              AND ($3::text IS NULL
                   OR strpos(id::text, $3) > 0
                   OR strpos(lower(coalesce(note, '')), $3) > 0)
              AND ($4::timestamptz IS NULL OR started_at >= $4)
              AND ($5::timestamptz IS NULL OR started_at <= $5)
              AND ($6::timestamptz IS NULL OR (started_at, id) < ($6, $7::uuid))
            ORDER BY started_at DESC, id DESC
            LIMIT $8
            "#
        ))
        .bind(&self.organization_id)
        .bind(filter.status)
        .bind(q)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.cursor.map(|c| c.started_at))
        .bind(filter.cursor.map(|c| c.id))
        .bind(filter.limit.max(1) + 1)
        .fetch_all(&self.db)
        .await?;

        Ok(into_page(
            rows.into_iter().map(Into::into).collect(),
            filter.limit,
        ))
    }

    async fn prune_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackupJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            DELETE FROM backup_jobs
            WHERE organization_id = $1 AND status <> 'running' AND started_at <= $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&self.organization_id)
        .bind(cutoff)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create_restore_request(
        &self,
        job_id: Uuid,
        requested_by: Option<String>,
        note: Option<String>,
    ) -> Result<RestoreRequest> {
        let request = RestoreRequest {
            id: Uuid::new_v4(),
            job_id,
            status: RESTORE_REQUESTED.to_string(),
            requested_by,
            note,
            created_at: db_now(),
        };
        sqlx::query(
            r#"
            INSERT INTO backup_restore_requests (id, job_id, status, requested_by, note, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(request.id)
        .bind(request.job_id)
        .bind(&request.status)
        .bind(&request.requested_by)
        .bind(&request.note)
        .bind(request.created_at)
        .execute(&self.db)
        .await?;
        Ok(request)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }
}

/// [`ConnectionStore`] over the `storage_connections` table.
pub struct PgConnectionStore {
    db: PgPool,
    organization_id: String,
}

impl PgConnectionStore {
    pub fn new(db: PgPool, organization_id: impl Into<String>) -> Self {
        Self {
            db,
            organization_id: organization_id.into(),
        }
    }
}

#[async_trait]
impl ConnectionStore for PgConnectionStore {
    async fn get(&self, id: &str) -> Result<Option<StorageConnection>> {
        let row: Option<(String, String, String, Value, Value)> = sqlx::query_as(
            r#"
            SELECT id, name, kind, config, secrets
            FROM storage_connections
            WHERE id = $1 AND organization_id = $2
            "#,
        )
        .bind(id)
        .bind(&self.organization_id)
        .fetch_optional(&self.db)
        .await?;

        let Some((id, name, kind, config, secrets)) = row else {
            return Ok(None);
        };
        let kind = ConnectionKind::parse(&kind).ok_or_else(|| {
            AppError::Dependency(format!("connection {} has unsupported kind '{}'", id, kind))
        })?;
        Ok(Some(StorageConnection {
            id,
            name,
            kind,
            config,
            secrets,
        }))
    }
}

/// [`DataExporter`] that dumps table `<target>` with `row_to_json`.
pub struct PgDataExporter {
    db: PgPool,
    organization_id: String,
}

impl PgDataExporter {
    pub fn new(db: PgPool, organization_id: impl Into<String>) -> Self {
        Self {
            db,
            organization_id: organization_id.into(),
        }
    }
}

#[async_trait]
impl DataExporter for PgDataExporter {
    async fn export(&self, target: &str, out: &Path) -> Result<Option<u64>> {
        if !is_safe_identifier(target)
            || target.starts_with("backup_")
            || RESTRICTED_TABLES.contains(&target)
        {
            tracing::warn!(target_name = target, "Refusing to export target");
            return Ok(None);
        }

        let exists: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(format!("public.{}", target))
            .fetch_one(&self.db)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        // Tables carrying an organization_id are exported for this organization only.
        let scoped: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.columns
                WHERE table_schema = 'public' AND table_name = $1 AND column_name = 'organization_id'
            )
            "#,
        )
        .bind(target)
        .fetch_one(&self.db)
        .await?;

        let sql = if scoped {
            format!(
                r#"SELECT row_to_json(t)::text FROM "{target}" t WHERE t.organization_id::text = $1"#
            )
        } else {
            format!(r#"SELECT row_to_json(t)::text FROM "{target}" t"#)
        };
        let mut query = sqlx::query_scalar::<_, String>(&sql);
        if scoped {
            query = query.bind(&self.organization_id);
        }

        let file = tokio::fs::File::create(out).await?;
        let mut writer = BufWriter::new(file);
        let mut rows = query.fetch(&self.db);
        let mut count = 0u64;
        while let Some(line) = rows.try_next().await? {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            count += 1;
        }
        writer.flush().await?;

        Ok(Some(count))
    }
}
