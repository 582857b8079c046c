//! Backup policy model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::destination::PolicyDestination;

/// Replication parallelism used when a policy does not set one.
pub const DEFAULT_PARALLELISM: i32 = 2;

/// Upper bound on replication parallelism.
pub const MAX_PARALLELISM: i32 = 16;

/// How often a policy fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Hourly,
    Daily,
    Weekly,
    Cron,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Hourly => "hourly",
            ScheduleKind::Daily => "daily",
            ScheduleKind::Weekly => "weekly",
            ScheduleKind::Cron => "cron",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hourly" => Some(ScheduleKind::Hourly),
            "daily" => Some(ScheduleKind::Daily),
            "weekly" => Some(ScheduleKind::Weekly),
            "cron" => Some(ScheduleKind::Cron),
            _ => None,
        }
    }
}

/// Notification channel toggles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct NotificationChannels {
    #[serde(default)]
    pub email: bool,
    #[serde(default)]
    pub chat: bool,
    #[serde(default)]
    pub webhook: bool,
}

impl NotificationChannels {
    pub fn any(&self) -> bool {
        self.email || self.chat || self.webhook
    }
}

/// The saved backup configuration of an organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BackupPolicy {
    pub enabled: bool,
    /// Logical data domains to export (users, roles, devices, ...).
    pub targets: Vec<String>,
    pub schedule: ScheduleKind,
    pub cron_expression: Option<String>,
    /// IANA timezone the schedule is evaluated in.
    pub timezone: String,
    /// Hour of day (0-23) for daily and weekly schedules.
    pub run_hour: i32,
    /// Day of week (0 = Sunday) for weekly schedules.
    pub run_weekday: i32,
    pub retention_days: i32,
    pub encrypt: bool,
    pub notifications: NotificationChannels,
    /// Minimum number of destinations that must succeed.
    pub min_success: i32,
    /// Concurrent replica uploads.
    pub parallelism: i32,
    /// Debounce marker written by the scheduler.
    pub last_scheduled_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            targets: Vec::new(),
            schedule: ScheduleKind::Daily,
            cron_expression: None,
            timezone: "UTC".to_string(),
            run_hour: 2,
            run_weekday: 0,
            retention_days: 30,
            encrypt: false,
            notifications: NotificationChannels::default(),
            min_success: 1,
            parallelism: DEFAULT_PARALLELISM,
            last_scheduled_at: None,
            updated_at: None,
        }
    }
}

/// A policy together with its ordered destination list.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct StoredPolicy {
    pub policy: BackupPolicy,
    pub destinations: Vec<PolicyDestination>,
}

impl StoredPolicy {
    pub fn primary(&self) -> Option<&PolicyDestination> {
        self.destinations.iter().find(|d| d.is_primary)
    }

    /// Replicas in ascending priority order.
    pub fn replicas(&self) -> Vec<&PolicyDestination> {
        let mut replicas: Vec<_> = self.destinations.iter().filter(|d| !d.is_primary).collect();
        replicas.sort_by_key(|d| d.priority);
        replicas
    }
}
