//! OpenAPI specification generated from handler annotations via utoipa.

use utoipa::OpenApi;

/// Top-level OpenAPI document for the backup orchestrator API.
///
/// Handler modules contribute their own paths and schemas via per-module
/// `#[derive(OpenApi)]` structs merged into this root document.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Backup Orchestrator API",
        description = "Policy-driven backup scheduling, replication and artifact access.",
        version = "0.1.0",
    ),
    servers(
        (url = "/", description = "Current server"),
    ),
    tags(
        (name = "backups", description = "Backup policy, jobs and artifacts"),
        (name = "health", description = "Health and readiness checks"),
    ),
    components(schemas(ErrorResponse))
)]
pub struct ApiDoc;

/// Standard error response body returned by all endpoints on failure.
#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g. "NOT_FOUND", "CONFLICT")
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

/// Build the merged OpenAPI document from all handler modules.
pub fn build_openapi() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();
    doc.merge(super::handlers::backups::BackupsApiDoc::openapi());
    doc.merge(super::handlers::health::HealthApiDoc::openapi());
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_contains_backup_routes() {
        let doc = build_openapi();
        let paths: Vec<_> = doc.paths.paths.keys().cloned().collect();
        assert!(paths.contains(&"/api/v1/backups/config".to_string()));
        assert!(paths.contains(&"/api/v1/backups/jobs/{id}/download".to_string()));
        assert!(paths.contains(&"/health".to_string()));
    }
}
