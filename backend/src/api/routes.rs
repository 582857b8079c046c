//! Route definitions for the API.

use axum::{routing::get, Json, Router};

use super::handlers;
use super::SharedState;

/// Create the main API router
pub fn create_router(state: SharedState) -> Router {
    // Build OpenAPI spec once at startup
    let openapi = super::openapi::build_openapi();

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { Json(openapi) }),
        )
        .nest("/api/v1/backups", handlers::backups::router())
        .with_state(state)
}
