//! Local filesystem destination.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{check_object_name, DestinationAdapter};
use crate::error::{AppError, Result};
use crate::models::destination::DestinationKind;
use crate::models::job::ArtifactLocation;

/// Writes archives into a directory on the engine host.
pub struct FilesystemAdapter {
    base_path: PathBuf,
}

impl FilesystemAdapter {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        check_object_name(name)?;
        Ok(self.base_path.join(name))
    }

    fn location(path: &Path) -> ArtifactLocation {
        ArtifactLocation::Local {
            path: path.to_string_lossy().into_owned(),
        }
    }

    fn local_path(location: &ArtifactLocation) -> Result<PathBuf> {
        match location {
            ArtifactLocation::Local { path } => Ok(PathBuf::from(path)),
            other => Err(AppError::Internal(format!(
                "local adapter cannot address a {} artifact",
                other.kind()
            ))),
        }
    }

    async fn ensure_base(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).await.map_err(|e| {
            AppError::Storage(format!(
                "Failed to create directory {}: {}",
                self.base_path.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl DestinationAdapter for FilesystemAdapter {
    fn kind(&self) -> DestinationKind {
        DestinationKind::Local
    }

    async fn put_object(&self, name: &str, content: Bytes) -> Result<ArtifactLocation> {
        let path = self.object_path(name)?;
        self.ensure_base().await?;

        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to create {}: {}", path.display(), e)))?;
        file.write_all(&content).await?;
        file.sync_all().await?;

        Ok(Self::location(&path))
    }

    async fn upload(&self, archive: &Path, name: &str) -> Result<ArtifactLocation> {
        let path = self.object_path(name)?;
        self.ensure_base().await?;

        let bytes = fs::copy(archive, &path).await.map_err(|e| {
            AppError::Storage(format!("Failed to copy archive to {}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), bytes, "Archive copied to local destination");

        Ok(Self::location(&path))
    }

    async fn read(&self, location: &ArtifactLocation) -> Result<Bytes> {
        let path = Self::local_path(location)?;
        let content = fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                AppError::NotFound(format!("artifact {} not found", path.display()))
            }
            _ => AppError::Storage(format!("Failed to read {}: {}", path.display(), e)),
        })?;
        Ok(Bytes::from(content))
    }

    async fn delete(&self, location: &ArtifactLocation) -> Result<()> {
        let path = Self::local_path(location)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to delete {}: {}", path.display(), e)))?;
        Ok(())
    }
}
