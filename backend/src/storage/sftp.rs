//! SFTP destination (replica only) over russh.
//!
//! Connection config: `host`, `port` (default 22), `username`, optional
//! `host_key_fingerprint` (SHA-256, as printed by `ssh-keygen -lf`).
//! Secrets: `password`, or `private_key` (OpenSSH PEM) with optional
//! `passphrase`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client;
use russh_keys::key;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{check_object_name, join_path, DestinationAdapter};
use crate::error::{AppError, Result};
use crate::models::connection::StorageConnection;
use crate::models::destination::DestinationKind;
use crate::models::job::ArtifactLocation;

#[derive(Clone)]
enum SftpAuth {
    Password(String),
    Key {
        private_key: String,
        passphrase: Option<String>,
    },
}

struct ClientHandler {
    host: String,
    expected_fingerprint: Option<String>,
}

/// Compare the server key fingerprint against the configured one. Without a
/// configured fingerprint any key is trusted, and that is logged.
fn host_key_accepted(host: &str, expected: Option<&str>, actual: &str) -> bool {
    match expected {
        Some(expected) => {
            let expected = expected.trim().trim_start_matches("SHA256:");
            if actual != expected {
                tracing::error!(host = %host, fingerprint = %actual, "SFTP host key does not match the configured fingerprint");
                return false;
            }
            true
        }
        None => {
            tracing::warn!(
                host = %host,
                fingerprint = %actual,
                "No host_key_fingerprint configured, trusting SFTP server key"
            );
            true
        }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(host_key_accepted(
            &self.host,
            self.expected_fingerprint.as_deref(),
            &server_public_key.fingerprint(),
        ))
    }
}

/// An open SFTP session plus the SSH handle keeping it alive.
struct Connected {
    handle: client::Handle<ClientHandler>,
    sftp: SftpSession,
}

impl Connected {
    async fn close(self) {
        let _ = self.sftp.close().await;
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

pub struct SftpAdapter {
    host: String,
    port: u16,
    username: String,
    auth: SftpAuth,
    expected_fingerprint: Option<String>,
    connection_id: String,
    directory: String,
}

impl SftpAdapter {
    pub fn new(connection: &StorageConnection, directory: &str) -> Result<Self> {
        let port = match connection.config_str("port") {
            Some(port) => port.parse().map_err(|_| {
                AppError::Dependency(format!(
                    "connection {} has an invalid port '{}'",
                    connection.id, port
                ))
            })?,
            None => 22,
        };

        let auth = match connection.secret_str("private_key") {
            Some(private_key) => SftpAuth::Key {
                private_key,
                passphrase: connection.secret_str("passphrase"),
            },
            None => SftpAuth::Password(connection.require_secret("password")?),
        };

        Ok(Self {
            host: connection.require_config("host")?,
            port,
            username: connection.require_config("username")?,
            auth,
            expected_fingerprint: connection.config_str("host_key_fingerprint"),
            connection_id: connection.id.clone(),
            directory: directory.to_string(),
        })
    }

    fn ssh_err(&self, step: &str, e: impl std::fmt::Display) -> AppError {
        AppError::Storage(format!(
            "SFTP {} on {}:{} failed: {}",
            step, self.host, self.port, e
        ))
    }

    async fn connect(&self) -> Result<Connected> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let handler = ClientHandler {
            host: self.host.clone(),
            expected_fingerprint: self.expected_fingerprint.clone(),
        };

        let mut handle = client::connect(config, (self.host.as_str(), self.port), handler)
            .await
            .map_err(|e| self.ssh_err("connect", e))?;

        let authenticated = match &self.auth {
            SftpAuth::Password(password) => handle
                .authenticate_password(&self.username, password)
                .await
                .map_err(|e| self.ssh_err("password authentication", e))?,
            SftpAuth::Key {
                private_key,
                passphrase,
            } => {
                let key_pair = russh_keys::decode_secret_key(private_key, passphrase.as_deref())
                    .map_err(|e| {
                        AppError::Dependency(format!(
                            "connection {} private key is unusable: {}",
                            self.connection_id, e
                        ))
                    })?;
                handle
                    .authenticate_publickey(&self.username, Arc::new(key_pair))
                    .await
                    .map_err(|e| self.ssh_err("key authentication", e))?
            }
        };
        if !authenticated {
            return Err(AppError::Storage(format!(
                "SFTP authentication rejected for {}@{}",
                self.username, self.host
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| self.ssh_err("channel open", e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| self.ssh_err("subsystem request", e))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| self.ssh_err("session start", e))?;

        Ok(Connected { handle, sftp })
    }

    /// mkdir -p for the destination directory.
    async fn ensure_directory(&self, sftp: &SftpSession) -> Result<()> {
        let mut current = String::new();
        for segment in self.directory.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            let exists = sftp
                .try_exists(current.as_str())
                .await
                .map_err(|e| self.ssh_err("stat", e))?;
            if !exists {
                sftp.create_dir(current.as_str())
                    .await
                    .map_err(|e| self.ssh_err("mkdir", e))?;
            }
        }
        Ok(())
    }

    fn remote_path(location: &ArtifactLocation) -> Result<&str> {
        match location {
            ArtifactLocation::Remote { path, .. } => Ok(path),
            other => Err(AppError::Internal(format!(
                "sftp adapter cannot address a {} artifact",
                other.kind()
            ))),
        }
    }

    async fn write_remote<R>(&self, name: &str, reader: &mut R) -> Result<ArtifactLocation>
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        check_object_name(name)?;
        let path = join_path(&self.directory, name);
        let session = self.connect().await?;

        let result = async {
            self.ensure_directory(&session.sftp).await?;
            let mut remote = session
                .sftp
                .create(path.as_str())
                .await
                .map_err(|e| self.ssh_err("create", e))?;
            let bytes = tokio::io::copy(reader, &mut remote)
                .await
                .map_err(|e| self.ssh_err("write", e))?;
            remote
                .shutdown()
                .await
                .map_err(|e| self.ssh_err("close", e))?;
            tracing::debug!(path = %path, bytes, host = %self.host, "SFTP upload successful");
            Ok::<_, AppError>(())
        }
        .await;

        session.close().await;
        result?;

        Ok(ArtifactLocation::Remote {
            connection_id: self.connection_id.clone(),
            path,
        })
    }
}

#[async_trait]
impl DestinationAdapter for SftpAdapter {
    fn kind(&self) -> DestinationKind {
        DestinationKind::Remote
    }

    async fn put_object(&self, name: &str, content: Bytes) -> Result<ArtifactLocation> {
        let mut reader: &[u8] = &content;
        self.write_remote(name, &mut reader).await
    }

    async fn upload(&self, archive: &Path, name: &str) -> Result<ArtifactLocation> {
        let mut file = tokio::fs::File::open(archive).await?;
        self.write_remote(name, &mut file).await
    }

    async fn read(&self, location: &ArtifactLocation) -> Result<Bytes> {
        let path = Self::remote_path(location)?;
        let session = self.connect().await?;

        let result = async {
            let mut remote = session
                .sftp
                .open(path)
                .await
                .map_err(|e| self.ssh_err("open", e))?;
            let mut data = Vec::new();
            remote
                .read_to_end(&mut data)
                .await
                .map_err(|e| self.ssh_err("read", e))?;
            Ok::<_, AppError>(Bytes::from(data))
        }
        .await;

        session.close().await;
        result
    }

    async fn delete(&self, location: &ArtifactLocation) -> Result<()> {
        let path = Self::remote_path(location)?;
        let session = self.connect().await?;
        let result = session
            .sftp
            .remove_file(path)
            .await
            .map_err(|e| self.ssh_err("remove", e));
        session.close().await;
        result
    }
}
