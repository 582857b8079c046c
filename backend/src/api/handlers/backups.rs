//! Backup control API handlers.

use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

use crate::api::download_response::DownloadResponse;
use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::connection::ConnectionSummary;
use crate::models::destination::{Destination, DestinationKind, DestinationTarget};
use crate::models::job::{
    ArtifactLocation, BackupJob, DestinationOutcome, HistoryCursor, HistoryFilter, HistoryPage,
    JobManifest, JobStatus, JobTrigger, RestoreRequest, TargetExport,
};
use crate::models::policy::{BackupPolicy, NotificationChannels, ScheduleKind};
use crate::services::backup_service::{
    BackupPermissions, PruneReport, RestoreInput, SchedulePreview,
};
use crate::services::policy_service::{PolicyConfig, PolicyUpdate, ReplicaConfig};
use crate::storage::ProbeReport;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(OpenApi)]
#[openapi(
    paths(
        get_config,
        save_config,
        get_permissions,
        list_history,
        schedule_preview,
        run_backup,
        prune_history,
        test_destination,
        get_job,
        retry_job,
        cancel_job,
        restore_job,
        get_job_log,
        get_job_manifest,
        download_job,
    ),
    components(schemas(
        PolicyConfig,
        PolicyUpdate,
        ReplicaConfig,
        BackupPolicy,
        ScheduleKind,
        NotificationChannels,
        Destination,
        DestinationKind,
        DestinationTarget,
        ConnectionSummary,
        BackupPermissions,
        HistoryPage,
        BackupJob,
        JobStatus,
        JobTrigger,
        ArtifactLocation,
        JobManifest,
        TargetExport,
        DestinationOutcome,
        RestoreRequest,
        RestoreInput,
        PruneReport,
        ProbeReport,
        SchedulePreview,
        TestDestinationRequest,
    ))
)]
pub struct BackupsApiDoc;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/config", get(get_config).put(save_config))
        .route("/permissions", get(get_permissions))
        .route("/history", get(list_history))
        .route("/schedule/preview", get(schedule_preview))
        .route("/run", post(run_backup))
        .route("/prune", post(prune_history))
        .route("/test-destination", post(test_destination))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/restore", post(restore_job))
        .route("/jobs/:id/log", get(get_job_log))
        .route("/jobs/:id/manifest", get(get_job_manifest))
        .route("/jobs/:id/download", get(download_job))
}

/// GET /api/v1/backups/config
#[utoipa::path(
    get,
    path = "/config",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "get_backup_config",
    responses(
        (status = 200, description = "Active backup configuration", body = PolicyConfig),
    ),
)]
pub async fn get_config(State(state): State<SharedState>) -> Result<Json<PolicyConfig>> {
    Ok(Json(state.policies.get_config().await?))
}

/// PUT /api/v1/backups/config
#[utoipa::path(
    put,
    path = "/config",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "save_backup_config",
    request_body = PolicyUpdate,
    responses(
        (status = 200, description = "Configuration saved", body = PolicyConfig),
        (status = 400, description = "Validation failed", body = crate::api::openapi::ErrorResponse),
    ),
)]
pub async fn save_config(
    State(state): State<SharedState>,
    Json(payload): Json<PolicyUpdate>,
) -> Result<Json<PolicyConfig>> {
    Ok(Json(state.policies.save_config(payload).await?))
}

/// GET /api/v1/backups/permissions
#[utoipa::path(
    get,
    path = "/permissions",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "get_backup_permissions",
    responses(
        (status = 200, description = "Capability flags", body = BackupPermissions),
    ),
)]
pub async fn get_permissions(State(state): State<SharedState>) -> Json<BackupPermissions> {
    Json(state.backups.permissions())
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct HistoryQuery {
    /// Opaque token from a previous page
    pub cursor: Option<String>,
    /// running, completed, failed or cancelled
    pub status: Option<String>,
    /// Search over job id and note
    pub q: Option<String>,
    /// RFC 3339 instant or YYYY-MM-DD
    pub from: Option<String>,
    /// RFC 3339 instant or YYYY-MM-DD (whole day)
    pub to: Option<String>,
    /// Page size, 1-100
    pub limit: Option<i64>,
}

impl HistoryQuery {
    pub fn into_filter(self) -> Result<HistoryFilter> {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(AppError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        let status = match non_empty(self.status) {
            Some(s) => Some(
                JobStatus::parse(&s)
                    .ok_or_else(|| AppError::Validation(format!("unknown job status '{}'", s)))?,
            ),
            None => None,
        };
        let from = non_empty(self.from)
            .map(|v| parse_bound(&v, false))
            .transpose()?;
        let to = non_empty(self.to).map(|v| parse_bound(&v, true)).transpose()?;
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(AppError::Validation("from must not be after to".into()));
            }
        }
        let cursor = non_empty(self.cursor)
            .map(|c| HistoryCursor::decode(&c))
            .transpose()?;

        Ok(HistoryFilter {
            status,
            q: non_empty(self.q),
            from,
            to,
            cursor,
            limit,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an RFC 3339 instant or a calendar date (UTC). A date used as an
/// upper bound covers the whole day.
fn parse_bound(value: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        AppError::Validation(format!(
            "'{}' is neither an RFC 3339 timestamp nor a YYYY-MM-DD date",
            value
        ))
    })?;
    let time = if end_of_day {
        date.and_hms_micro_opt(23, 59, 59, 999_999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| AppError::Validation(format!("invalid date '{}'", value)))
}

/// GET /api/v1/backups/history
#[utoipa::path(
    get,
    path = "/history",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "list_backup_history",
    params(HistoryQuery),
    responses(
        (status = 200, description = "One page of jobs, newest first", body = HistoryPage),
        (status = 400, description = "Invalid filter or cursor", body = crate::api::openapi::ErrorResponse),
    ),
)]
pub async fn list_history(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>> {
    let filter = query.into_filter()?;
    Ok(Json(state.backups.history(&filter).await?))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PreviewQuery {
    /// Number of upcoming runs, 1-50 (default 5)
    pub count: Option<usize>,
}

/// GET /api/v1/backups/schedule/preview
#[utoipa::path(
    get,
    path = "/schedule/preview",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "preview_backup_schedule",
    params(PreviewQuery),
    responses(
        (status = 200, description = "Upcoming scheduled runs", body = SchedulePreview),
        (status = 404, description = "No policy saved", body = crate::api::openapi::ErrorResponse),
    ),
)]
pub async fn schedule_preview(
    State(state): State<SharedState>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<SchedulePreview>> {
    Ok(Json(
        state
            .backups
            .schedule_preview(query.count, Utc::now())
            .await?,
    ))
}

/// POST /api/v1/backups/run
#[utoipa::path(
    post,
    path = "/run",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "run_backup",
    responses(
        (status = 202, description = "Backup job queued", body = BackupJob),
        (status = 400, description = "No usable policy", body = crate::api::openapi::ErrorResponse),
    ),
)]
pub async fn run_backup(State(state): State<SharedState>) -> Result<impl IntoResponse> {
    let job = state.backups.run_now().await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// POST /api/v1/backups/prune
#[utoipa::path(
    post,
    path = "/prune",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "prune_backup_history",
    responses(
        (status = 200, description = "Retention sweep result", body = PruneReport),
    ),
)]
pub async fn prune_history(State(state): State<SharedState>) -> Result<Json<PruneReport>> {
    Ok(Json(state.backups.prune(Utc::now()).await?))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TestDestinationRequest {
    pub destination: Destination,
}

/// POST /api/v1/backups/test-destination
#[utoipa::path(
    post,
    path = "/test-destination",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "test_backup_destination",
    request_body = TestDestinationRequest,
    responses(
        (status = 200, description = "Probe phases", body = ProbeReport),
        (status = 400, description = "Malformed destination", body = crate::api::openapi::ErrorResponse),
    ),
)]
pub async fn test_destination(
    State(state): State<SharedState>,
    Json(payload): Json<TestDestinationRequest>,
) -> Result<Json<ProbeReport>> {
    Ok(Json(
        state.backups.test_destination(&payload.destination).await?,
    ))
}

/// GET /api/v1/backups/jobs/:id
#[utoipa::path(
    get,
    path = "/jobs/{id}",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "get_backup_job",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job details", body = BackupJob),
        (status = 404, description = "Job not found", body = crate::api::openapi::ErrorResponse),
    ),
)]
pub async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BackupJob>> {
    Ok(Json(state.backups.get_job(id).await?))
}

/// POST /api/v1/backups/jobs/:id/retry
#[utoipa::path(
    post,
    path = "/jobs/{id}/retry",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "retry_backup_job",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 202, description = "Job queued again", body = BackupJob),
        (status = 409, description = "Job is not failed", body = crate::api::openapi::ErrorResponse),
    ),
)]
pub async fn retry_job(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let job = state.backups.retry(id).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// POST /api/v1/backups/jobs/:id/cancel
#[utoipa::path(
    post,
    path = "/jobs/{id}/cancel",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "cancel_backup_job",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 202, description = "Cancellation requested", body = BackupJob),
        (status = 409, description = "Job is not running", body = crate::api::openapi::ErrorResponse),
    ),
)]
pub async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let job = state.backups.cancel(id).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// POST /api/v1/backups/jobs/:id/restore
#[utoipa::path(
    post,
    path = "/jobs/{id}/restore",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "restore_backup_job",
    params(("id" = Uuid, Path, description = "Job ID")),
    request_body = RestoreInput,
    responses(
        (status = 201, description = "Restore request recorded", body = RestoreRequest),
        (status = 403, description = "Restore not permitted", body = crate::api::openapi::ErrorResponse),
        (status = 409, description = "Job is not completed", body = crate::api::openapi::ErrorResponse),
    ),
)]
pub async fn restore_job(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    payload: Option<Json<RestoreInput>>,
) -> Result<impl IntoResponse> {
    let input = payload.map(|Json(p)| p).unwrap_or_default();
    let request = state.backups.restore(id, input).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

/// GET /api/v1/backups/jobs/:id/log
#[utoipa::path(
    get,
    path = "/jobs/{id}/log",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "get_backup_job_log",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job log", content_type = "text/plain", body = String),
        (status = 404, description = "Job not found", body = crate::api::openapi::ErrorResponse),
    ),
)]
pub async fn get_job_log(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let log = state.backups.log(id).await?;
    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], log))
}

/// GET /api/v1/backups/jobs/:id/manifest
#[utoipa::path(
    get,
    path = "/jobs/{id}/manifest",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "get_backup_job_manifest",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job manifest", body = JobManifest),
        (status = 404, description = "No manifest for this job", body = crate::api::openapi::ErrorResponse),
    ),
)]
pub async fn get_job_manifest(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobManifest>> {
    Ok(Json(state.backups.manifest(id).await?))
}

/// GET /api/v1/backups/jobs/:id/download
#[utoipa::path(
    get,
    path = "/jobs/{id}/download",
    context_path = "/api/v1/backups",
    tag = "backups",
    operation_id = "download_backup_job",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Archive bytes", content_type = "application/octet-stream"),
        (status = 302, description = "Redirect to a presigned URL"),
        (status = 403, description = "Download not permitted", body = crate::api::openapi::ErrorResponse),
        (status = 409, description = "Job is not completed", body = crate::api::openapi::ErrorResponse),
    ),
)]
pub async fn download_job(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<DownloadResponse> {
    Ok(DownloadResponse(state.backups.download(id).await?))
}
