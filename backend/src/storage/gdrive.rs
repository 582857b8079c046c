//! Google Drive destination (Drive API v3).
//!
//! Connection config: `folder_id` (root folder, default `root`).
//! Secrets: `access_token`, or `refresh_token` + `client_id` +
//! `client_secret`, exchanged for an access token on first use.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Body, Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;

use super::{check_object_name, DestinationAdapter};
use crate::error::{AppError, Result};
use crate::models::connection::StorageConnection;
use crate::models::destination::DestinationKind;
use crate::models::job::ArtifactLocation;

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Clone)]
enum DriveAuth {
    AccessToken(String),
    Refresh {
        refresh_token: String,
        client_id: String,
        client_secret: String,
    },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// File metadata from Google Drive API.
#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

pub struct GoogleDriveAdapter {
    client: Client,
    auth: DriveAuth,
    connection_id: String,
    root_folder: String,
    subfolder: Option<String>,
    token: OnceCell<String>,
    folder: OnceCell<String>,
}

impl GoogleDriveAdapter {
    pub fn new(
        client: Client,
        connection: &StorageConnection,
        subfolder: Option<String>,
    ) -> Result<Self> {
        let auth = match connection.secret_str("access_token") {
            Some(token) => DriveAuth::AccessToken(token),
            None => DriveAuth::Refresh {
                refresh_token: connection.require_secret("refresh_token")?,
                client_id: connection.require_secret("client_id")?,
                client_secret: connection.require_secret("client_secret")?,
            },
        };

        Ok(Self {
            client,
            auth,
            connection_id: connection.id.clone(),
            root_folder: connection
                .config_str("folder_id")
                .unwrap_or_else(|| "root".into()),
            subfolder: subfolder.filter(|s| !s.trim().is_empty()),
            token: OnceCell::new(),
            folder: OnceCell::new(),
        })
    }

    async fn access_token(&self) -> Result<&str> {
        let token = self
            .token
            .get_or_try_init(|| async {
                match &self.auth {
                    DriveAuth::AccessToken(token) => Ok(token.clone()),
                    DriveAuth::Refresh {
                        refresh_token,
                        client_id,
                        client_secret,
                    } => {
                        let resp = self
                            .client
                            .post(GOOGLE_TOKEN_URL)
                            .form(&[
                                ("grant_type", "refresh_token"),
                                ("refresh_token", refresh_token.as_str()),
                                ("client_id", client_id.as_str()),
                                ("client_secret", client_secret.as_str()),
                            ])
                            .send()
                            .await
                            .map_err(|e| {
                                AppError::Dependency(format!("Google token refresh failed: {}", e))
                            })?;

                        if !resp.status().is_success() {
                            let body = resp.text().await.unwrap_or_default();
                            return Err(AppError::Dependency(format!(
                                "Google token refresh rejected: {}",
                                body
                            )));
                        }
                        let token: TokenResponse = resp.json().await.map_err(|e| {
                            AppError::Dependency(format!("Failed to parse token response: {}", e))
                        })?;
                        Ok(token.access_token)
                    }
                }
            })
            .await?;
        Ok(token.as_str())
    }

    /// Folder that receives uploads: the root folder or the named subfolder,
    /// created on first use.
    async fn target_folder(&self) -> Result<&str> {
        let folder = self
            .folder
            .get_or_try_init(|| async {
                let Some(name) = &self.subfolder else {
                    return Ok(self.root_folder.clone());
                };
                if let Some(id) = self.find_folder(name).await? {
                    return Ok(id);
                }
                self.create_folder(name).await
            })
            .await?;
        Ok(folder.as_str())
    }

    async fn find_folder(&self, name: &str) -> Result<Option<String>> {
        let token = self.access_token().await?;
        let query = format!(
            "name = '{}' and '{}' in parents and mimeType = '{}' and trashed = false",
            name.replace('\\', "\\\\").replace('\'', "\\'"),
            self.root_folder,
            FOLDER_MIME
        );
        let resp = self
            .client
            .get(format!("{DRIVE_API_BASE}/files"))
            .bearer_auth(token)
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id,name)"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("Drive folder lookup failed: {}", e)))?;
        let list: FileList = Self::json_or_error(resp, "folder lookup").await?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_folder(&self, name: &str) -> Result<String> {
        let token = self.access_token().await?;
        let resp = self
            .client
            .post(format!("{DRIVE_API_BASE}/files"))
            .bearer_auth(token)
            .query(&[("supportsAllDrives", "true"), ("fields", "id,name")])
            .json(&json!({
                "name": name,
                "mimeType": FOLDER_MIME,
                "parents": [self.root_folder],
            }))
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("Drive folder create failed: {}", e)))?;
        let folder: DriveFile = Self::json_or_error(resp, "folder create").await?;
        tracing::info!(folder = %name, id = %folder.id, "Created Google Drive backup folder");
        Ok(folder.id)
    }

    async fn json_or_error<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
        what: &str,
    ) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Storage(format!(
                "Drive {} returned {}: {}",
                what, status, body
            )));
        }
        resp.json()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to parse Drive {} response: {}", what, e)))
    }

    /// Resumable upload: open a session with the metadata, then PUT the bytes.
    async fn upload_body(&self, name: &str, body: Body, length: u64) -> Result<ArtifactLocation> {
        check_object_name(name)?;
        let folder = self.target_folder().await?.to_string();
        let token = self.access_token().await?;

        let session = self
            .client
            .post(format!("{DRIVE_UPLOAD_BASE}/files"))
            .bearer_auth(token)
            .query(&[("uploadType", "resumable"), ("supportsAllDrives", "true")])
            .header("X-Upload-Content-Type", "application/octet-stream")
            .header("X-Upload-Content-Length", length)
            .json(&json!({ "name": name, "parents": [folder] }))
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("Drive upload session failed: {}", e)))?;

        if !session.status().is_success() {
            let status = session.status();
            let body = session.text().await.unwrap_or_default();
            return Err(AppError::Storage(format!(
                "Drive upload session returned {}: {}",
                status, body
            )));
        }
        let upload_url = session
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AppError::Storage("Drive upload session has no Location".into()))?;

        let resp = self
            .client
            .put(upload_url)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("Drive upload failed: {}", e)))?;
        let file: DriveFile = Self::json_or_error(resp, "upload").await?;

        tracing::debug!(file_id = %file.id, bytes = length, "Google Drive upload successful");
        Ok(ArtifactLocation::Gdrive {
            connection_id: self.connection_id.clone(),
            file_id: file.id,
            file_name: file.name.or_else(|| Some(name.to_string())),
        })
    }

    fn file_id(location: &ArtifactLocation) -> Result<&str> {
        match location {
            ArtifactLocation::Gdrive { file_id, .. } => Ok(file_id),
            other => Err(AppError::Internal(format!(
                "gdrive adapter cannot address a {} artifact",
                other.kind()
            ))),
        }
    }
}

#[async_trait]
impl DestinationAdapter for GoogleDriveAdapter {
    fn kind(&self) -> DestinationKind {
        DestinationKind::Gdrive
    }

    async fn put_object(&self, name: &str, content: Bytes) -> Result<ArtifactLocation> {
        let length = content.len() as u64;
        self.upload_body(name, Body::from(content), length).await
    }

    async fn upload(&self, archive: &Path, name: &str) -> Result<ArtifactLocation> {
        let file = tokio::fs::File::open(archive).await?;
        let length = file.metadata().await?.len();
        self.upload_body(name, Body::wrap_stream(ReaderStream::new(file)), length)
            .await
    }

    async fn read(&self, location: &ArtifactLocation) -> Result<Bytes> {
        let file_id = Self::file_id(location)?;
        let token = self.access_token().await?;
        let resp = self
            .client
            .get(format!("{DRIVE_API_BASE}/files/{file_id}"))
            .bearer_auth(token)
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("Drive download failed: {}", e)))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(AppError::NotFound(format!(
                "Drive file {} not found",
                file_id
            ))),
            s if !s.is_success() => Err(AppError::Storage(format!(
                "Drive download of {} returned {}",
                file_id, s
            ))),
            _ => resp
                .bytes()
                .await
                .map_err(|e| AppError::Storage(format!("Drive download body: {}", e))),
        }
    }

    async fn delete(&self, location: &ArtifactLocation) -> Result<()> {
        let file_id = Self::file_id(location)?;
        let token = self.access_token().await?;
        let resp = self
            .client
            .delete(format!("{DRIVE_API_BASE}/files/{file_id}"))
            .bearer_auth(token)
            .query(&[("supportsAllDrives", "true")])
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("Drive delete failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(AppError::Storage(format!(
                "Drive delete of {} returned {}",
                file_id,
                resp.status()
            )));
        }
        Ok(())
    }
}
