//! Prometheus metrics collection and HTTP request instrumentation.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};

use crate::error::{AppError, Result};

/// Initialize the Prometheus metrics recorder and return the handle for rendering.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Internal(format!("failed to install Prometheus recorder: {}", e)))
}

/// Axum middleware that records HTTP request metrics.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().clone().to_string();
    let path = request.uri().path().to_string();
    // Normalize path to avoid high-cardinality labels (strip job ids)
    let normalized = normalize_path(&path);

    let start = Instant::now();
    gauge!("bo_http_requests_in_flight", "method" => method.clone(), "path" => normalized.clone())
        .increment(1.0);

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    histogram!("bo_http_request_duration_seconds", "method" => method.clone(), "path" => normalized.clone(), "status" => status.clone()).record(duration);
    counter!("bo_http_responses_total", "method" => method.clone(), "path" => normalized.clone(), "status" => status).increment(1);
    gauge!("bo_http_requests_in_flight", "method" => method, "path" => normalized).decrement(1.0);

    response
}

/// Replace UUID path segments with a placeholder.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if uuid::Uuid::parse_str(seg).is_ok() {
                ":id"
            } else {
                seg
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Record a finished backup job.
pub fn record_backup(trigger: &str, status: &str, duration_secs: f64, size_bytes: Option<i64>) {
    counter!("bo_backup_jobs_total", "trigger" => trigger.to_string(), "status" => status.to_string()).increment(1);
    histogram!("bo_backup_duration_seconds", "trigger" => trigger.to_string())
        .record(duration_secs);
    if let Some(size) = size_bytes {
        histogram!("bo_backup_archive_size_bytes").record(size as f64);
    }
}

/// Record one destination transfer.
pub fn record_destination_upload(kind: &str, primary: bool, success: bool) {
    let role = if primary { "primary" } else { "replica" };
    let status = if success { "success" } else { "failure" };
    counter!("bo_destination_uploads_total", "kind" => kind.to_string(), "role" => role, "status" => status).increment(1);
}

/// Record a notification delivery attempt.
pub fn record_notification(channel: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("bo_notifications_total", "channel" => channel.to_string(), "status" => status).increment(1);
}

/// Record a prune run.
pub fn record_prune(jobs_removed: u64) {
    counter!("bo_pruned_jobs_total").increment(jobs_removed);
}

/// Set while the worker is processing a job.
pub fn set_worker_busy(busy: bool) {
    gauge!("bo_worker_busy").set(if busy { 1.0 } else { 0.0 });
}
