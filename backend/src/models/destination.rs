//! Backup destinations and their shape validation.
//!
//! A destination is a named, reusable description of where an archive can be
//! written. The set of kinds is closed; kind-specific fields live in
//! [`DestinationTarget`].

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, Result};

/// Storage kind of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Local,
    S3,
    Nextcloud,
    Gdrive,
    Remote,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Local => "local",
            DestinationKind::S3 => "s3",
            DestinationKind::Nextcloud => "nextcloud",
            DestinationKind::Gdrive => "gdrive",
            DestinationKind::Remote => "remote",
        }
    }
}

impl std::fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific destination payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DestinationTarget {
    /// Absolute directory on the engine host.
    Local { path: String },
    /// S3-compatible bucket; bucket/prefix override the connection's.
    S3 {
        connection_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bucket: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
    /// WebDAV collection, path relative to the connection's WebDAV root.
    Nextcloud { connection_id: String, path: String },
    /// Google Drive folder, optionally a named subfolder of the root folder.
    Gdrive {
        connection_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subfolder: Option<String>,
    },
    /// SFTP directory. Replica only.
    Remote { connection_id: String, path: String },
}

impl DestinationTarget {
    pub fn kind(&self) -> DestinationKind {
        match self {
            DestinationTarget::Local { .. } => DestinationKind::Local,
            DestinationTarget::S3 { .. } => DestinationKind::S3,
            DestinationTarget::Nextcloud { .. } => DestinationKind::Nextcloud,
            DestinationTarget::Gdrive { .. } => DestinationKind::Gdrive,
            DestinationTarget::Remote { .. } => DestinationKind::Remote,
        }
    }

    /// Identifier of the external storage connection, if the kind uses one.
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            DestinationTarget::Local { .. } => None,
            DestinationTarget::S3 { connection_id, .. }
            | DestinationTarget::Nextcloud { connection_id, .. }
            | DestinationTarget::Gdrive { connection_id, .. }
            | DestinationTarget::Remote { connection_id, .. } => Some(connection_id),
        }
    }

    /// Check the kind-specific field rules.
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = self.connection_id() {
            if id.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "{} destination requires a connection_id",
                    self.kind()
                )));
            }
        }

        match self {
            DestinationTarget::Local { path } => validate_absolute_path("local path", path),
            DestinationTarget::S3 { bucket, prefix, .. } => {
                if let Some(bucket) = bucket {
                    if bucket.trim().is_empty() || bucket.contains('/') {
                        return Err(AppError::Validation(format!(
                            "invalid s3 bucket override '{}'",
                            bucket
                        )));
                    }
                }
                if let Some(prefix) = prefix {
                    reject_traversal("s3 prefix", prefix)?;
                }
                Ok(())
            }
            DestinationTarget::Nextcloud { path, .. } => {
                validate_absolute_path("nextcloud path", path)
            }
            DestinationTarget::Gdrive { subfolder, .. } => {
                if let Some(folder) = subfolder {
                    if folder.contains('/') || folder == "." || folder == ".." {
                        return Err(AppError::Validation(format!(
                            "gdrive subfolder '{}' must be a single folder name",
                            folder
                        )));
                    }
                }
                Ok(())
            }
            DestinationTarget::Remote { path, .. } => validate_absolute_path("remote path", path),
        }
    }
}

/// Role a destination plays in a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationRole {
    Primary,
    Replica,
}

/// A named destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Destination {
    pub name: String,
    pub target: DestinationTarget,
}

impl Destination {
    pub fn new(name: impl Into<String>, target: DestinationTarget) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }

    pub fn kind(&self) -> DestinationKind {
        self.target.kind()
    }

    /// Validate the destination for the given role.
    pub fn validate(&self, role: DestinationRole) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("destination name must not be empty".into()));
        }
        if role == DestinationRole::Primary && self.kind() == DestinationKind::Remote {
            return Err(AppError::Validation(format!(
                "destination '{}': remote (SFTP) destinations can only be used as replicas",
                self.name
            )));
        }
        self.target
            .validate()
            .map_err(|e| match e {
                AppError::Validation(msg) => {
                    AppError::Validation(format!("destination '{}': {}", self.name, msg))
                }
                other => other,
            })
    }
}

/// An entry of a policy's (or a job snapshot's) ordered destination list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PolicyDestination {
    pub destination: Destination,
    pub is_primary: bool,
    pub priority: i32,
}

fn validate_absolute_path(label: &str, path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(AppError::Validation(format!(
            "{} '{}' must be absolute (start with '/')",
            label, path
        )));
    }
    reject_traversal(label, path)
}

fn reject_traversal(label: &str, path: &str) -> Result<()> {
    if path.contains('\0') || path.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(AppError::Validation(format!(
            "{} '{}' must not contain traversal sequences",
            label, path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(path: &str) -> Destination {
        Destination::new(
            "disk",
            DestinationTarget::Local {
                path: path.to_string(),
            },
        )
    }

    #[test]
    fn test_local_rejects_relative_traversal() {
        let err = local("../etc").validate(DestinationRole::Primary).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_local_rejects_embedded_traversal() {
        assert!(local("/var/backups/../../etc")
            .validate(DestinationRole::Primary)
            .is_err());
        assert!(local("/var/backups").validate(DestinationRole::Primary).is_ok());
    }

    #[test]
    fn test_nextcloud_requires_leading_slash() {
        let dest = Destination::new(
            "cloud",
            DestinationTarget::Nextcloud {
                connection_id: "nc-1".into(),
                path: "backups".into(),
            },
        );
        assert!(dest.validate(DestinationRole::Replica).is_err());

        let dest = Destination::new(
            "cloud",
            DestinationTarget::Nextcloud {
                connection_id: "nc-1".into(),
                path: "/backups".into(),
            },
        );
        assert!(dest.validate(DestinationRole::Replica).is_ok());
    }

    #[test]
    fn test_remote_not_allowed_as_primary() {
        let dest = Destination::new(
            "offsite",
            DestinationTarget::Remote {
                connection_id: "sftp-1".into(),
                path: "/srv/backups".into(),
            },
        );
        let err = dest.validate(DestinationRole::Primary).unwrap_err();
        assert!(err.to_string().contains("only be used as replicas"));
        assert!(dest.validate(DestinationRole::Replica).is_ok());
    }

    #[test]
    fn test_connection_id_required() {
        let dest = Destination::new(
            "bucket",
            DestinationTarget::S3 {
                connection_id: "  ".into(),
                bucket: None,
                prefix: None,
            },
        );
        assert!(dest.validate(DestinationRole::Primary).is_err());
    }

    #[test]
    fn test_target_serializes_with_kind_tag() {
        let target = DestinationTarget::S3 {
            connection_id: "c1".into(),
            bucket: Some("archive".into()),
            prefix: None,
        };
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json["kind"], "s3");
        assert_eq!(json["bucket"], "archive");
        assert!(json.get("prefix").is_none());
    }
}
