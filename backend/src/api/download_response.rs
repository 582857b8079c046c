//! Download response for archives: streamed bytes or a redirect to a
//! presigned URL.

use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::storage::ArtifactDownload;

/// Header to indicate how the archive was served
pub const X_ARTIFACT_STORAGE: &str = "x-artifact-storage";

pub struct DownloadResponse(pub ArtifactDownload);

fn content_type_for(filename: &str) -> &'static str {
    if filename.ends_with(".tar.gz") {
        "application/gzip"
    } else {
        "application/octet-stream"
    }
}

impl IntoResponse for DownloadResponse {
    fn into_response(self) -> Response {
        let built = match self.0 {
            ArtifactDownload::Redirect(presigned) => {
                tracing::debug!(expires_in = presigned.expires_in.as_secs(), "Serving archive via redirect");
                Response::builder()
                    .status(StatusCode::FOUND)
                    .header(LOCATION, presigned.url)
                    .header(X_ARTIFACT_STORAGE, "redirect")
                    .header(
                        CACHE_CONTROL,
                        format!("private, max-age={}", presigned.expires_in.as_secs()),
                    )
                    .body(Body::empty())
            }
            ArtifactDownload::Content { data, filename } => {
                tracing::debug!(size = data.len(), filename = %filename, "Serving archive via proxy");
                Response::builder()
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, content_type_for(&filename))
                    .header(CONTENT_LENGTH, data.len())
                    .header(X_ARTIFACT_STORAGE, "proxy")
                    .header(
                        CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{}\"", filename.replace('"', "")),
                    )
                    .body(Body::from(data))
            }
        };

        built.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to build download response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
    }
}
