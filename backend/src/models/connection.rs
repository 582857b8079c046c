//! Storage connections, read from the external credential store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use super::destination::DestinationKind;
use crate::error::{AppError, Result};

/// Kind of a storage connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    S3,
    Nextcloud,
    Gdrive,
    Sftp,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::S3 => "s3",
            ConnectionKind::Nextcloud => "nextcloud",
            ConnectionKind::Gdrive => "gdrive",
            ConnectionKind::Sftp => "sftp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "s3" => Some(ConnectionKind::S3),
            "nextcloud" | "webdav" => Some(ConnectionKind::Nextcloud),
            "gdrive" | "google_drive" => Some(ConnectionKind::Gdrive),
            "sftp" => Some(ConnectionKind::Sftp),
            _ => None,
        }
    }

    /// Connection kind a destination of `kind` must reference.
    pub fn for_destination(kind: DestinationKind) -> Option<Self> {
        match kind {
            DestinationKind::Local => None,
            DestinationKind::S3 => Some(ConnectionKind::S3),
            DestinationKind::Nextcloud => Some(ConnectionKind::Nextcloud),
            DestinationKind::Gdrive => Some(ConnectionKind::Gdrive),
            DestinationKind::Remote => Some(ConnectionKind::Sftp),
        }
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A credential-bearing connection. Never serialized as-is.
#[derive(Debug, Clone)]
pub struct StorageConnection {
    pub id: String,
    pub name: String,
    pub kind: ConnectionKind,
    pub config: Value,
    pub secrets: Value,
}

impl StorageConnection {
    pub fn config_str(&self, key: &str) -> Option<String> {
        non_empty(&self.config, key)
    }

    pub fn secret_str(&self, key: &str) -> Option<String> {
        non_empty(&self.secrets, key)
    }

    pub fn require_config(&self, key: &str) -> Result<String> {
        self.config_str(key).ok_or_else(|| {
            AppError::Dependency(format!("connection {} is missing config '{}'", self.id, key))
        })
    }

    pub fn require_secret(&self, key: &str) -> Result<String> {
        self.secret_str(key).ok_or_else(|| {
            AppError::Dependency(format!("connection {} is missing secret '{}'", self.id, key))
        })
    }

    /// Ensure the connection matches what the destination expects.
    pub fn expect_kind(&self, expected: ConnectionKind) -> Result<()> {
        if self.kind != expected {
            return Err(AppError::Dependency(format!(
                "connection {} is a {} connection, expected {}",
                self.id, self.kind, expected
            )));
        }
        Ok(())
    }

    pub fn redacted(&self) -> ConnectionSummary {
        let secrets = match &self.secrets {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), !is_blank(v)))
                .collect(),
            _ => BTreeMap::new(),
        };
        ConnectionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            secrets,
        }
    }
}

/// Redacted view: secret presence flags only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ConnectionSummary {
    pub id: String,
    pub name: String,
    pub kind: ConnectionKind,
    pub secrets: BTreeMap<String, bool>,
}

fn non_empty(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conn() -> StorageConnection {
        StorageConnection {
            id: "c1".into(),
            name: "offsite bucket".into(),
            kind: ConnectionKind::S3,
            config: json!({"bucket": "archive", "region": "eu-west-1", "port": 2222}),
            secrets: json!({"access_key_id": "AKIA", "secret_access_key": "", "session": null}),
        }
    }

    #[test]
    fn test_redacted_exposes_presence_only() {
        let summary = conn().redacted();
        assert_eq!(summary.secrets.get("access_key_id"), Some(&true));
        assert_eq!(summary.secrets.get("secret_access_key"), Some(&false));
        assert_eq!(summary.secrets.get("session"), Some(&false));
        let json = serde_json::to_string(&summary).unwrap();
        assert!(!json.contains("AKIA"));
    }

    #[test]
    fn test_kind_mismatch_is_dependency_error() {
        let err = conn().expect_kind(ConnectionKind::Sftp).unwrap_err();
        assert!(matches!(err, AppError::Dependency(_)));
        assert!(err.to_string().contains("is a s3 connection, expected sftp"));
    }

    #[test]
    fn test_config_reads_numbers_and_skips_blank() {
        let c = conn();
        assert_eq!(c.config_str("port").as_deref(), Some("2222"));
        assert!(c.secret_str("secret_access_key").is_none());
        assert!(c.require_secret("secret_access_key").is_err());
    }
}
