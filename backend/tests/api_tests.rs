//! HTTP-level tests for the backup API router.

mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use serde_json::{json, Value};
use tower::ServiceExt;

use backup_orchestrator_backend::models::job::{JobStatus, JobTrigger};
use backup_orchestrator_backend::store::BackupStore;

use common::TestEngine;

async fn send(engine: &TestEngine, method: Method, uri: &str, body: Option<Value>) -> Response {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    engine.router().oneshot(request).await.unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn config_body() -> Value {
    json!({
        "enabled": true,
        "targets": ["Users", "users", " devices "],
        "schedule": "weekly",
        "run_hour": 3,
        "run_weekday": 1,
        "retention_days": 14,
        "notifications": {"webhook": true},
        "min_success": 2,
        "parallelism": 2,
        "primary": {"name": "disk", "target": {"kind": "local", "path": "/var/backups"}},
        "replicas": [
            {"destination": {"name": "offsite", "target": {"kind": "remote", "connection_id": "sftp-1", "path": "/srv/backups"}}, "priority": 2},
            {"destination": {"name": "cloud", "target": {"kind": "s3", "connection_id": "s3-1"}}, "priority": 1}
        ]
    })
}

#[tokio::test]
async fn test_health_reports_idle_worker() {
    let engine = TestEngine::new();
    let response = send(&engine, Method::GET, "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["store"]["status"], "healthy");
    assert_eq!(body["checks"]["worker"]["status"], "idle");
}

#[tokio::test]
async fn test_metrics_unavailable_without_recorder() {
    let engine = TestEngine::new();
    let response = send(&engine, Method::GET, "/metrics", None).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_openapi_document_served() {
    let engine = TestEngine::new();
    let response = send(&engine, Method::GET, "/api-docs/openapi.json", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["paths"]["/api/v1/backups/run"].is_object());
}

#[tokio::test]
async fn test_config_defaults_before_first_save() {
    let engine = TestEngine::new();
    let response = send(&engine, Method::GET, "/api/v1/backups/config", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["policy"]["enabled"], false);
    assert_eq!(body["policy"]["retention_days"], 30);
    assert!(body["primary"].is_null());
    assert_eq!(body["replicas"], json!([]));
}

#[tokio::test]
async fn test_save_config_normalizes_and_reports_missing_connections() {
    let engine = TestEngine::new();
    let response = send(
        &engine,
        Method::PUT,
        "/api/v1/backups/config",
        Some(config_body()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["policy"]["targets"], json!(["users", "devices"]));
    assert_eq!(body["policy"]["schedule"], "weekly");
    assert_eq!(body["policy"]["timezone"], "UTC");
    assert_eq!(body["primary"]["name"], "disk");
    assert_eq!(body["replicas"][0]["destination"]["name"], "cloud");
    assert_eq!(body["replicas"][1]["destination"]["name"], "offsite");

    let missing = body["missing_connections"].as_array().unwrap();
    assert_eq!(missing.len(), 2);

    // The saved policy round-trips through GET.
    let response = send(&engine, Method::GET, "/api/v1/backups/config", None).await;
    let body = body_json(response).await;
    assert_eq!(body["policy"]["retention_days"], 14);
    assert_eq!(body["policy"]["min_success"], 2);
}

#[tokio::test]
async fn test_save_config_rejects_unreachable_quorum() {
    let engine = TestEngine::new();
    let mut config = config_body();
    config["min_success"] = json!(4);

    let response = send(&engine, Method::PUT, "/api/v1/backups/config", Some(config)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "VALIDATION_ERROR");

    // Nothing was persisted.
    assert!(engine.store.get_policy().await.unwrap().is_none());
}

#[tokio::test]
async fn test_save_config_rejects_remote_primary() {
    let engine = TestEngine::new();
    let mut config = config_body();
    config["primary"] = json!({
        "name": "offsite",
        "target": {"kind": "remote", "connection_id": "sftp-1", "path": "/srv/backups"}
    });
    config["replicas"] = json!([]);
    config["min_success"] = json!(1);

    let response = send(&engine, Method::PUT, "/api/v1/backups/config", Some(config)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_permissions_reflect_configuration() {
    let engine = TestEngine::with_config(|c| c.allow_download = false);
    let response = send(&engine, Method::GET, "/api/v1/backups/permissions", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body, json!({"can_restore": true, "can_download": false}));
}

#[tokio::test]
async fn test_run_accepts_and_returns_job() {
    let engine = TestEngine::new();
    engine.save_policy(&[], 1, 1).await;

    let response = send(&engine, Method::POST, "/api/v1/backups/run", None).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["status"], "running");
    assert_eq!(body["trigger"], "manual");

    let id: uuid::Uuid = body["id"].as_str().unwrap().parse().unwrap();
    let job = engine.wait_for_finish(id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let response = send(
        &engine,
        Method::GET,
        &format!("/api/v1/backups/jobs/{}/log", id),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let log = body_text(response).await;
    assert!(log.contains("Job started (manual)"));
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let engine = TestEngine::new();
    let uri = format!("/api/v1/backups/jobs/{}/retry", uuid::Uuid::new_v4());
    let response = send(&engine, Method::POST, &uri, None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_cancel_completed_job_conflicts() {
    let engine = TestEngine::new();
    engine.save_policy(&[], 1, 1).await;
    let job = engine.store.create_job(JobTrigger::Manual).await.unwrap();
    engine.worker.run_once().await.unwrap().unwrap();

    let uri = format!("/api/v1/backups/jobs/{}/cancel", job.id);
    let response = send(&engine, Method::POST, &uri, None).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_restore_without_body_is_created() {
    let engine = TestEngine::new();
    engine.save_policy(&[], 1, 1).await;
    let job = engine.store.create_job(JobTrigger::Manual).await.unwrap();
    engine.worker.run_once().await.unwrap().unwrap();

    let uri = format!("/api/v1/backups/jobs/{}/restore", job.id);
    let response = send(&engine, Method::POST, &uri, None).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["status"], "requested");
    assert_eq!(body["job_id"], job.id.to_string());
}

#[tokio::test]
async fn test_download_serves_archive_inline() {
    let engine = TestEngine::new();
    engine.seed_users().await;
    engine.save_policy(&[], 1, 1).await;
    let job = engine.store.create_job(JobTrigger::Manual).await.unwrap();
    engine.worker.run_once().await.unwrap().unwrap();

    let uri = format!("/api/v1/backups/jobs/{}/download", job.id);
    let response = send(&engine, Method::GET, &uri, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
        "application/gzip"
    );
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.starts_with("attachment;"));
    assert!(disposition.contains(".tar.gz"));
}

#[tokio::test]
async fn test_history_rejects_invalid_query() {
    let engine = TestEngine::new();
    for uri in [
        "/api/v1/backups/history?limit=0",
        "/api/v1/backups/history?limit=101",
        "/api/v1/backups/history?status=exploded",
        "/api/v1/backups/history?from=2024-03-02&to=2024-03-01",
        "/api/v1/backups/history?cursor=bogus",
    ] {
        let response = send(&engine, Method::GET, uri, None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
    }
}

#[tokio::test]
async fn test_history_pages_newest_first() {
    let engine = TestEngine::new();
    engine.save_policy(&[], 1, 1).await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        let job = engine.store.create_job(JobTrigger::Manual).await.unwrap();
        ids.push(job.id);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let response = send(&engine, Method::GET, "/api/v1/backups/history?limit=2", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let page = body_json(response).await;
    let items = page["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["id"], ids[2].to_string());
    assert_eq!(items[1]["id"], ids[1].to_string());

    let cursor = page["next_cursor"].as_str().unwrap();
    let uri = format!("/api/v1/backups/history?limit=2&cursor={}", cursor);
    let page = body_json(send(&engine, Method::GET, &uri, None).await).await;
    let items = page["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], ids[0].to_string());
    assert!(page["next_cursor"].is_null());

    let uri = "/api/v1/backups/history?status=completed";
    let page = body_json(send(&engine, Method::GET, uri, None).await).await;
    assert!(page["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_schedule_preview_without_policy_is_not_found() {
    let engine = TestEngine::new();
    let response = send(&engine, Method::GET, "/api/v1/backups/schedule/preview", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_test_destination_reports_probe() {
    let engine = TestEngine::new();
    let body = json!({
        "destination": {"name": "scratch", "target": {"kind": "local", "path": "/tmp/probe"}}
    });
    let response = send(
        &engine,
        Method::POST,
        "/api/v1/backups/test-destination",
        Some(body),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["write"], true);
    assert_eq!(report["read"], true);
    assert_eq!(report["delete"], true);
}
