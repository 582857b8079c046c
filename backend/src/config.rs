//! Application configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{AppError, Result};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL. When unset the in-memory store is used.
    pub database_url: Option<String>,

    /// Server bind address (host:port)
    pub bind_address: String,

    /// Organization whose default backup policy this engine drives
    pub organization_id: String,

    /// Parent directory for per-job scratch directories
    pub scratch_dir: PathBuf,

    /// Scheduler tick period in seconds (also the due-window width)
    pub scheduler_interval_secs: u64,

    /// Worker pump period in seconds
    pub worker_interval_secs: u64,

    /// Debounce window for the scheduled marker in seconds
    pub debounce_secs: u64,

    /// Retention sweep period in seconds (0 disables the sweep)
    pub retention_sweep_interval_secs: u64,

    /// Retention applied when no policy has been saved yet
    pub default_retention_days: i32,

    /// Upper bound accepted for a policy's retention
    pub max_retention_days: i32,

    /// Passphrase used to encrypt archives when a policy asks for it
    pub encryption_key: Option<String>,

    /// Lifetime of presigned download URLs in seconds
    pub presign_expiry_secs: u64,

    /// Whether prune also deletes the primary archive object
    pub prune_remote_artifacts: bool,

    /// Capability flag exposed to the UI and enforced on restore
    pub allow_restore: bool,

    /// Capability flag exposed to the UI and enforced on download
    pub allow_download: bool,

    /// Notification channel endpoints
    pub notifications: NotificationConfig,
}

/// Endpoints and credentials for the notification channels.
#[derive(Debug, Clone, Default)]
pub struct NotificationConfig {
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: Option<String>,
    pub email_to: Vec<String>,
    pub chat_webhook_url: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            organization_id: env::var("BACKUP_ORGANIZATION_ID")
                .unwrap_or_else(|_| "default".into()),
            scratch_dir: env::var("BACKUP_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("backup-scratch")),
            scheduler_interval_secs: parse_env("BACKUP_SCHEDULER_INTERVAL_SECS", 30),
            worker_interval_secs: parse_env("BACKUP_WORKER_INTERVAL_SECS", 15),
            debounce_secs: parse_env("BACKUP_DEBOUNCE_SECS", 30),
            retention_sweep_interval_secs: parse_env(
                "BACKUP_RETENTION_SWEEP_INTERVAL_SECS",
                6 * 3600,
            ),
            default_retention_days: parse_env("BACKUP_DEFAULT_RETENTION_DAYS", 30),
            max_retention_days: parse_env("BACKUP_MAX_RETENTION_DAYS", 3650),
            encryption_key: env::var("BACKUP_ENCRYPTION_KEY").ok().filter(|v| !v.is_empty()),
            presign_expiry_secs: parse_env("BACKUP_PRESIGN_EXPIRY_SECS", 900),
            prune_remote_artifacts: parse_bool_env("BACKUP_PRUNE_REMOTE_ARTIFACTS", false),
            allow_restore: parse_bool_env("BACKUP_ALLOW_RESTORE", true),
            allow_download: parse_bool_env("BACKUP_ALLOW_DOWNLOAD", true),
            notifications: NotificationConfig {
                smtp_host: env::var("SMTP_HOST").ok(),
                smtp_port: parse_env("SMTP_PORT", 587),
                smtp_username: env::var("SMTP_USERNAME").ok(),
                smtp_password: env::var("SMTP_PASSWORD").ok(),
                smtp_from: env::var("SMTP_FROM").ok(),
                email_to: env::var("BACKUP_NOTIFY_EMAIL_TO")
                    .map(|v| split_list(&v))
                    .unwrap_or_default(),
                chat_webhook_url: env::var("BACKUP_NOTIFY_CHAT_WEBHOOK_URL").ok(),
                webhook_url: env::var("BACKUP_NOTIFY_WEBHOOK_URL").ok(),
                webhook_secret: env::var("BACKUP_NOTIFY_WEBHOOK_SECRET").ok(),
            },
        };

        if config.max_retention_days < 1 {
            return Err(AppError::Config(
                "BACKUP_MAX_RETENTION_DAYS must be at least 1".into(),
            ));
        }
        if config.scheduler_interval_secs == 0 || config.worker_interval_secs == 0 {
            return Err(AppError::Config(
                "scheduler and worker intervals must be greater than zero".into(),
            ));
        }

        Ok(config)
    }

    /// Configuration suitable for tests and embedded use: in-memory store,
    /// no notification endpoints, default intervals.
    pub fn for_tests(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            database_url: None,
            bind_address: "127.0.0.1:0".into(),
            organization_id: "default".into(),
            scratch_dir: scratch_dir.into(),
            scheduler_interval_secs: 30,
            worker_interval_secs: 15,
            debounce_secs: 30,
            retention_sweep_interval_secs: 0,
            default_retention_days: 30,
            max_retention_days: 3650,
            encryption_key: None,
            presign_expiry_secs: 900,
            prune_remote_artifacts: false,
            allow_restore: true,
            allow_download: true,
            notifications: NotificationConfig::default(),
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
