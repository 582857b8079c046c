//! WebDAV (Nextcloud) destination.
//!
//! Connection config: `base_url` (the WebDAV root, e.g.
//! `https://cloud.example.com/remote.php/dav/files/backup`), `username`.
//! Secret: `password` (an app password on Nextcloud).

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Body, Client, Method, StatusCode, Url};
use std::path::Path;
use tokio_util::io::ReaderStream;

use super::{check_object_name, join_path, DestinationAdapter};
use crate::error::{AppError, Result};
use crate::models::connection::StorageConnection;
use crate::models::destination::DestinationKind;
use crate::models::job::ArtifactLocation;

pub struct WebDavAdapter {
    http: Client,
    base_url: Url,
    username: String,
    password: String,
    connection_id: String,
    /// Collection path below the WebDAV root, always starting with '/'.
    directory: String,
}

impl WebDavAdapter {
    pub fn new(http: Client, connection: &StorageConnection, directory: &str) -> Result<Self> {
        let base = connection.require_config("base_url")?;
        let base_url = Url::parse(&base).map_err(|e| {
            AppError::Dependency(format!(
                "connection {} has an invalid base_url: {}",
                connection.id, e
            ))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Dependency(format!(
                "connection {} base_url cannot be used as a WebDAV root",
                connection.id
            )));
        }

        Ok(Self {
            http,
            base_url,
            username: connection.require_config("username")?,
            password: connection.require_secret("password")?,
            connection_id: connection.id.clone(),
            directory: directory.to_string(),
        })
    }

    /// Percent-encoded URL for `path` below the WebDAV root.
    fn url_for(&self, path: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AppError::Internal("WebDAV root is not a base URL".into()))?;
            segments.pop_if_empty();
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                segments.push(segment);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    /// MKCOL every missing collection along the destination directory.
    async fn ensure_collection(&self) -> Result<()> {
        let mkcol = Method::from_bytes(b"MKCOL")
            .map_err(|e| AppError::Internal(format!("MKCOL method: {}", e)))?;

        let mut current = String::new();
        for segment in self.directory.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);

            let response = self
                .request(mkcol.clone(), self.url_for(&current)?)
                .send()
                .await
                .map_err(|e| AppError::Storage(format!("WebDAV MKCOL {} failed: {}", current, e)))?;

            match response.status() {
                // 405: collection already exists
                s if s.is_success() || s == StatusCode::METHOD_NOT_ALLOWED => {}
                s => {
                    return Err(AppError::Storage(format!(
                        "WebDAV MKCOL {} returned {}",
                        current, s
                    )))
                }
            }
        }
        Ok(())
    }

    fn location(&self, path: String) -> ArtifactLocation {
        ArtifactLocation::Nextcloud {
            connection_id: self.connection_id.clone(),
            path,
        }
    }

    fn remote_path(location: &ArtifactLocation) -> Result<&str> {
        match location {
            ArtifactLocation::Nextcloud { path, .. } => Ok(path),
            other => Err(AppError::Internal(format!(
                "webdav adapter cannot address a {} artifact",
                other.kind()
            ))),
        }
    }

    async fn put_body(&self, name: &str, body: Body, length: u64) -> Result<ArtifactLocation> {
        check_object_name(name)?;
        self.ensure_collection().await?;

        let path = join_path(&self.directory, name);
        let response = self
            .request(Method::PUT, self.url_for(&path)?)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("WebDAV PUT {} failed: {}", path, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Storage(format!(
                "WebDAV PUT {} returned {}",
                path,
                response.status()
            )));
        }

        tracing::debug!(path = %path, bytes = length, "WebDAV upload successful");
        Ok(self.location(path))
    }
}

#[async_trait]
impl DestinationAdapter for WebDavAdapter {
    fn kind(&self) -> DestinationKind {
        DestinationKind::Nextcloud
    }

    async fn put_object(&self, name: &str, content: Bytes) -> Result<ArtifactLocation> {
        let length = content.len() as u64;
        self.put_body(name, Body::from(content), length).await
    }

    async fn upload(&self, archive: &Path, name: &str) -> Result<ArtifactLocation> {
        let file = tokio::fs::File::open(archive).await?;
        let length = file.metadata().await?.len();
        let body = Body::wrap_stream(ReaderStream::new(file));
        self.put_body(name, body, length).await
    }

    async fn read(&self, location: &ArtifactLocation) -> Result<Bytes> {
        let path = Self::remote_path(location)?;
        let response = self
            .request(Method::GET, self.url_for(path)?)
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("WebDAV GET {} failed: {}", path, e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(AppError::NotFound(format!("artifact {} not found", path))),
            s if !s.is_success() => Err(AppError::Storage(format!(
                "WebDAV GET {} returned {}",
                path, s
            ))),
            _ => response
                .bytes()
                .await
                .map_err(|e| AppError::Storage(format!("WebDAV GET {} body: {}", path, e))),
        }
    }

    async fn delete(&self, location: &ArtifactLocation) -> Result<()> {
        let path = Self::remote_path(location)?;
        let response = self
            .request(Method::DELETE, self.url_for(path)?)
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("WebDAV DELETE {} failed: {}", path, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Storage(format!(
                "WebDAV DELETE {} returned {}",
                path,
                response.status()
            )));
        }
        Ok(())
    }
}
