//! S3-compatible destination using the rust-s3 crate.
//!
//! Connection config keys: `bucket`, `region` (default us-east-1),
//! `endpoint` for S3-compatible services (MinIO etc.), `prefix`.
//! Secrets: `access_key_id`, `secret_access_key`.

use async_trait::async_trait;
use bytes::Bytes;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;
use std::path::Path;
use std::time::Duration;

use super::{check_object_name, ArtifactDownload, DestinationAdapter, PresignedUrl};
use crate::error::{AppError, Result};
use crate::models::connection::StorageConnection;
use crate::models::destination::DestinationKind;
use crate::models::job::ArtifactLocation;

/// Resolved S3 settings for one destination.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub prefix: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl S3Settings {
    /// Merge connection config with the destination's bucket/prefix overrides.
    pub fn from_connection(
        connection: &StorageConnection,
        bucket_override: Option<&str>,
        prefix_override: Option<&str>,
    ) -> Result<Self> {
        let bucket = match bucket_override {
            Some(bucket) => bucket.to_string(),
            None => connection.require_config("bucket")?,
        };
        let prefix = prefix_override
            .map(str::to_string)
            .or_else(|| connection.config_str("prefix"))
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            bucket,
            region: connection
                .config_str("region")
                .unwrap_or_else(|| "us-east-1".into()),
            endpoint: connection.config_str("endpoint"),
            prefix,
            access_key_id: connection.require_secret("access_key_id")?,
            secret_access_key: connection.require_secret("secret_access_key")?,
        })
    }
}

/// S3-compatible destination.
pub struct S3Adapter {
    bucket: Box<Bucket>,
    bucket_name: String,
    prefix: Option<String>,
    connection_id: String,
    presign_expiry: Duration,
}

impl S3Adapter {
    pub fn new(settings: S3Settings, connection_id: &str, presign_expiry: Duration) -> Result<Self> {
        let credentials = Credentials::new(
            Some(settings.access_key_id.as_str()),
            Some(settings.secret_access_key.as_str()),
            None,
            None,
            None,
        )
        .map_err(|e| AppError::Dependency(format!("Invalid S3 credentials: {}", e)))?;

        // Create region (with optional custom endpoint)
        let region = match &settings.endpoint {
            Some(endpoint) => Region::Custom {
                region: settings.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => settings.region.parse().map_err(|_| {
                AppError::Dependency(format!("Invalid S3 region: {}", settings.region))
            })?,
        };

        let bucket = Bucket::new(&settings.bucket, region, credentials)
            .map_err(|e| AppError::Dependency(format!("Failed to create S3 bucket: {}", e)))?;

        // Path-style access for S3-compatible endpoints
        let bucket = if settings.endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Self {
            bucket,
            bucket_name: settings.bucket,
            prefix: settings.prefix,
            connection_id: connection_id.to_string(),
            presign_expiry,
        })
    }

    /// Generate the full S3 key with optional prefix
    fn full_key(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), name),
            None => name.to_string(),
        }
    }

    fn location(&self, key: String) -> ArtifactLocation {
        ArtifactLocation::S3 {
            connection_id: self.connection_id.clone(),
            bucket: self.bucket_name.clone(),
            key,
        }
    }

    fn object_key(location: &ArtifactLocation) -> Result<&str> {
        match location {
            ArtifactLocation::S3 { key, .. } => Ok(key),
            other => Err(AppError::Internal(format!(
                "s3 adapter cannot address a {} artifact",
                other.kind()
            ))),
        }
    }
}

#[async_trait]
impl DestinationAdapter for S3Adapter {
    fn kind(&self) -> DestinationKind {
        DestinationKind::S3
    }

    async fn put_object(&self, name: &str, content: Bytes) -> Result<ArtifactLocation> {
        check_object_name(name)?;
        let key = self.full_key(name);

        self.bucket
            .put_object(&key, &content)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to put object '{}': {}", key, e)))?;

        tracing::debug!(key = %key, bytes = content.len(), "S3 put object successful");
        Ok(self.location(key))
    }

    async fn upload(&self, archive: &Path, name: &str) -> Result<ArtifactLocation> {
        check_object_name(name)?;
        let key = self.full_key(name);

        let mut file = tokio::fs::File::open(archive).await?;
        let bytes = file.metadata().await?.len();
        self.bucket
            .put_object_stream(&mut file, &key)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to upload '{}': {}", key, e)))?;

        tracing::debug!(
            key = %key,
            bucket = %self.bucket_name,
            bytes,
            "S3 streamed upload successful"
        );
        Ok(self.location(key))
    }

    async fn read(&self, location: &ArtifactLocation) -> Result<Bytes> {
        let key = Self::object_key(location)?;
        let response = self.bucket.get_object(key).await.map_err(|e| {
            let err_str = e.to_string();
            if err_str.contains("404") || err_str.contains("NoSuchKey") {
                AppError::NotFound(format!("Storage key not found: {}", key))
            } else {
                AppError::Storage(format!("Failed to get object '{}': {}", key, e))
            }
        })?;
        Ok(Bytes::from(response.to_vec()))
    }

    async fn delete(&self, location: &ArtifactLocation) -> Result<()> {
        let key = Self::object_key(location)?;
        self.bucket
            .delete_object(key)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to delete object '{}': {}", key, e)))?;
        Ok(())
    }

    async fn download(&self, location: &ArtifactLocation) -> Result<ArtifactDownload> {
        let key = Self::object_key(location)?;
        let expiry_secs = self.presign_expiry.as_secs().min(u32::MAX as u64) as u32;
        let url = self
            .bucket
            .presign_get(key, expiry_secs, None)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to presign '{}': {}", key, e)))?;

        Ok(ArtifactDownload::Redirect(PresignedUrl {
            url,
            expires_in: self.presign_expiry,
        }))
    }
}
