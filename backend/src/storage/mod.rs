//! Destination adapters.
//!
//! One adapter per destination kind behind [`DestinationAdapter`]. Adapters
//! are built per use by an [`AdapterFactory`], which resolves the referenced
//! storage connection just in time so credentials never outlive one job.

pub mod filesystem;
pub mod gdrive;
pub mod s3;
pub mod sftp;
pub mod webdav;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::connection::{ConnectionKind, StorageConnection};
use crate::models::destination::{Destination, DestinationKind, DestinationTarget};
use crate::models::job::ArtifactLocation;
use crate::store::ConnectionStore;

/// Result of a presigned URL request
#[derive(Debug, Clone)]
pub struct PresignedUrl {
    /// The presigned URL for direct access
    pub url: String,
    /// When the URL expires
    pub expires_in: Duration,
}

/// What a download resolves to.
#[derive(Debug, Clone)]
pub enum ArtifactDownload {
    /// Materialized archive bytes.
    Content { data: Bytes, filename: String },
    /// Time-limited URL the client should be redirected to.
    Redirect(PresignedUrl),
}

/// Uniform transfer contract over one destination.
#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    fn kind(&self) -> DestinationKind;

    /// Store `content` as object `name` in the destination directory.
    async fn put_object(&self, name: &str, content: Bytes) -> Result<ArtifactLocation>;

    /// Upload the archive file at `archive` as object `name`.
    async fn upload(&self, archive: &Path, name: &str) -> Result<ArtifactLocation> {
        let content = tokio::fs::read(archive).await?;
        self.put_object(name, Bytes::from(content)).await
    }

    async fn read(&self, location: &ArtifactLocation) -> Result<Bytes>;

    async fn delete(&self, location: &ArtifactLocation) -> Result<()>;

    /// Resolve a download. Defaults to materializing the bytes.
    async fn download(&self, location: &ArtifactLocation) -> Result<ArtifactDownload> {
        let data = self.read(location).await?;
        Ok(ArtifactDownload::Content {
            data,
            filename: location.file_name(),
        })
    }
}

/// Phase breakdown of a write/read/delete probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ProbeReport {
    pub write: bool,
    pub read: bool,
    pub delete: bool,
    /// First failure, prefixed with the phase it happened in.
    pub error: Option<String>,
}

impl ProbeReport {
    pub fn ok(&self) -> bool {
        self.write && self.read && self.delete
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Marker object name used by probes.
pub fn probe_marker_name() -> String {
    format!(".backup-probe-{}.txt", Uuid::new_v4())
}

/// Write a marker object, read it back, compare, then delete it.
pub async fn probe(adapter: &dyn DestinationAdapter) -> ProbeReport {
    let name = probe_marker_name();
    let payload = Bytes::from(format!(
        "backup destination probe {} {}\n",
        name,
        chrono::Utc::now().to_rfc3339()
    ));
    let mut report = ProbeReport::default();

    let location = match adapter.put_object(&name, payload.clone()).await {
        Ok(location) => location,
        Err(e) => {
            report.error = Some(format!("write: {}", e));
            return report;
        }
    };
    report.write = true;

    match adapter.read(&location).await {
        Ok(data) if data == payload => report.read = true,
        Ok(data) => {
            report.error = Some(format!(
                "read: marker content mismatch ({} bytes written, {} read back)",
                payload.len(),
                data.len()
            ));
        }
        Err(e) => report.error = Some(format!("read: {}", e)),
    }

    // Cleanup is attempted even after a failed read.
    match adapter.delete(&location).await {
        Ok(()) => report.delete = true,
        Err(e) => {
            if report.error.is_none() {
                report.error = Some(format!("delete: {}", e));
            }
        }
    }

    tracing::debug!(
        kind = %adapter.kind(),
        write = report.write,
        read = report.read,
        delete = report.delete,
        "Destination probe finished"
    );
    report
}

/// Builds adapters for destinations.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn adapter_for(&self, destination: &Destination) -> Result<Box<dyn DestinationAdapter>>;

    /// Adapter able to read or delete an artifact at `location`.
    async fn adapter_for_location(
        &self,
        location: &ArtifactLocation,
    ) -> Result<Box<dyn DestinationAdapter>> {
        let destination = Destination::new(location.kind().as_str(), location.as_target());
        self.adapter_for(&destination).await
    }
}

/// Factory resolving connections from a [`ConnectionStore`].
pub struct DefaultAdapterFactory {
    connections: Arc<dyn ConnectionStore>,
    http: reqwest::Client,
    presign_expiry: Duration,
}

impl DefaultAdapterFactory {
    pub fn new(connections: Arc<dyn ConnectionStore>, presign_expiry: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("backup-orchestrator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            connections,
            http,
            presign_expiry,
        })
    }

    async fn connection(&self, id: &str, kind: DestinationKind) -> Result<StorageConnection> {
        let connection = self
            .connections
            .get(id)
            .await?
            .ok_or_else(|| AppError::Dependency(format!("connection {} not found", id)))?;
        if let Some(expected) = ConnectionKind::for_destination(kind) {
            connection.expect_kind(expected)?;
        }
        Ok(connection)
    }
}

#[async_trait]
impl AdapterFactory for DefaultAdapterFactory {
    async fn adapter_for(&self, destination: &Destination) -> Result<Box<dyn DestinationAdapter>> {
        let kind = destination.kind();
        let adapter: Box<dyn DestinationAdapter> = match &destination.target {
            DestinationTarget::Local { path } => {
                Box::new(filesystem::FilesystemAdapter::new(path))
            }
            DestinationTarget::S3 {
                connection_id,
                bucket,
                prefix,
            } => {
                let connection = self.connection(connection_id, kind).await?;
                let settings = s3::S3Settings::from_connection(
                    &connection,
                    bucket.as_deref(),
                    prefix.as_deref(),
                )?;
                Box::new(s3::S3Adapter::new(settings, connection_id, self.presign_expiry)?)
            }
            DestinationTarget::Nextcloud {
                connection_id,
                path,
            } => {
                let connection = self.connection(connection_id, kind).await?;
                Box::new(webdav::WebDavAdapter::new(
                    self.http.clone(),
                    &connection,
                    path,
                )?)
            }
            DestinationTarget::Gdrive {
                connection_id,
                subfolder,
            } => {
                let connection = self.connection(connection_id, kind).await?;
                Box::new(gdrive::GoogleDriveAdapter::new(
                    self.http.clone(),
                    &connection,
                    subfolder.clone(),
                )?)
            }
            DestinationTarget::Remote {
                connection_id,
                path,
            } => {
                let connection = self.connection(connection_id, kind).await?;
                Box::new(sftp::SftpAdapter::new(&connection, path)?)
            }
        };
        Ok(adapter)
    }
}

/// Reject object names that could escape the destination directory.
pub(crate) fn check_object_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(AppError::Validation(format!("invalid object name '{}'", name)));
    }
    Ok(())
}

/// Join a directory and an object name with exactly one slash.
pub(crate) fn join_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}
