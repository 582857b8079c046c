//! Policy configuration: validation, normalization and persistence.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, Result};
use crate::models::connection::ConnectionSummary;
use crate::models::destination::{Destination, DestinationRole, PolicyDestination};
use crate::models::policy::{
    BackupPolicy, NotificationChannels, ScheduleKind, StoredPolicy, DEFAULT_PARALLELISM,
    MAX_PARALLELISM,
};
use crate::services::schedule::CompiledSchedule;
use crate::store::{BackupStore, ConnectionStore};

/// A replica entry of a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ReplicaConfig {
    pub destination: Destination,
    /// Lower runs earlier. Defaults to the 1-based position in the list.
    #[serde(default)]
    pub priority: Option<i32>,
}

/// Body of a configuration save.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PolicyUpdate {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub targets: Vec<String>,
    pub schedule: ScheduleKind,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub run_hour: Option<i32>,
    #[serde(default)]
    pub run_weekday: Option<i32>,
    #[serde(default)]
    pub retention_days: Option<i32>,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default)]
    pub notifications: NotificationChannels,
    #[serde(default)]
    pub min_success: Option<i32>,
    #[serde(default)]
    pub parallelism: Option<i32>,
    pub primary: Destination,
    #[serde(default)]
    pub replicas: Vec<ReplicaConfig>,
}

/// The active configuration as shown to operators.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PolicyConfig {
    pub policy: BackupPolicy,
    pub primary: Option<Destination>,
    pub replicas: Vec<ReplicaConfig>,
    /// Redacted view of every referenced connection.
    pub connections: Vec<ConnectionSummary>,
    /// Referenced connection ids that could not be resolved.
    pub missing_connections: Vec<String>,
}

pub struct PolicyService {
    store: Arc<dyn BackupStore>,
    connections: Arc<dyn ConnectionStore>,
    default_retention_days: i32,
    max_retention_days: i32,
}

impl PolicyService {
    pub fn new(
        store: Arc<dyn BackupStore>,
        connections: Arc<dyn ConnectionStore>,
        default_retention_days: i32,
        max_retention_days: i32,
    ) -> Self {
        Self {
            store,
            connections,
            default_retention_days,
            max_retention_days,
        }
    }

    /// Load the active configuration. An unsaved policy yields the defaults.
    pub async fn get_config(&self) -> Result<PolicyConfig> {
        let stored = match self.store.get_policy().await? {
            Some(stored) => stored,
            None => StoredPolicy {
                policy: BackupPolicy {
                    retention_days: self.default_retention_days,
                    ..BackupPolicy::default()
                },
                destinations: Vec::new(),
            },
        };
        self.present(stored).await
    }

    /// Validate, normalize and persist a configuration.
    pub async fn save_config(&self, update: PolicyUpdate) -> Result<PolicyConfig> {
        let (policy, destinations) = self.normalize(update)?;
        let stored = self.store.save_policy(&policy, &destinations).await?;
        tracing::info!(
            enabled = stored.policy.enabled,
            schedule = stored.policy.schedule.as_str(),
            destinations = stored.destinations.len(),
            "Backup policy saved"
        );
        self.present(stored).await
    }

    /// Pure validation and normalization of an update.
    pub fn normalize(&self, update: PolicyUpdate) -> Result<(BackupPolicy, Vec<PolicyDestination>)> {
        let retention_days = update.retention_days.unwrap_or(self.default_retention_days);
        if retention_days < 1 || retention_days > self.max_retention_days {
            return Err(AppError::Validation(format!(
                "retention_days must be between 1 and {}, got {}",
                self.max_retention_days, retention_days
            )));
        }

        let cron_expression = match update.schedule {
            ScheduleKind::Cron => {
                let expr = update
                    .cron_expression
                    .as_deref()
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .ok_or_else(|| {
                        AppError::Validation("cron schedule requires a cron expression".into())
                    })?;
                Some(expr.to_string())
            }
            _ => None,
        };

        let policy = BackupPolicy {
            enabled: update.enabled,
            targets: normalize_targets(&update.targets),
            schedule: update.schedule,
            cron_expression,
            timezone: update
                .timezone
                .map(|tz| tz.trim().to_string())
                .filter(|tz| !tz.is_empty())
                .unwrap_or_else(|| "UTC".to_string()),
            run_hour: update.run_hour.unwrap_or(2),
            run_weekday: update.run_weekday.unwrap_or(0),
            retention_days,
            encrypt: update.encrypt,
            notifications: update.notifications,
            min_success: update.min_success.unwrap_or(1),
            parallelism: update.parallelism.unwrap_or(DEFAULT_PARALLELISM),
            last_scheduled_at: None,
            updated_at: None,
        };

        // Validates timezone, hour, weekday and cron syntax.
        CompiledSchedule::from_policy(&policy)?;

        let mut primary = update.primary;
        primary.name = primary.name.trim().to_string();
        primary.validate(DestinationRole::Primary)?;

        let mut replicas = Vec::with_capacity(update.replicas.len());
        for (index, replica) in update.replicas.into_iter().enumerate() {
            let mut destination = replica.destination;
            destination.name = destination.name.trim().to_string();
            destination.validate(DestinationRole::Replica)?;
            replicas.push(PolicyDestination {
                destination,
                is_primary: false,
                priority: replica.priority.unwrap_or(index as i32 + 1),
            });
        }

        let mut seen = HashSet::new();
        for name in std::iter::once(&primary.name).chain(replicas.iter().map(|r| &r.destination.name)) {
            if !seen.insert(name.clone()) {
                return Err(AppError::Validation(format!(
                    "destination name '{}' is used more than once",
                    name
                )));
            }
        }

        let total = replicas.len() as i32 + 1;
        if policy.min_success < 1 || policy.min_success > total {
            return Err(AppError::Validation(format!(
                "min_success must be between 1 and the number of destinations ({}), got {}",
                total, policy.min_success
            )));
        }
        if policy.parallelism < 1 || policy.parallelism > MAX_PARALLELISM {
            return Err(AppError::Validation(format!(
                "parallelism must be between 1 and {}, got {}",
                MAX_PARALLELISM, policy.parallelism
            )));
        }

        replicas.sort_by(|a, b| {
            (a.priority, &a.destination.name).cmp(&(b.priority, &b.destination.name))
        });

        let mut destinations = Vec::with_capacity(replicas.len() + 1);
        destinations.push(PolicyDestination {
            destination: primary,
            is_primary: true,
            priority: 0,
        });
        destinations.extend(replicas);

        Ok((policy, destinations))
    }

    async fn present(&self, stored: StoredPolicy) -> Result<PolicyConfig> {
        let primary = stored.primary().map(|d| d.destination.clone());
        let replicas = stored
            .replicas()
            .into_iter()
            .map(|d| ReplicaConfig {
                destination: d.destination.clone(),
                priority: Some(d.priority),
            })
            .collect();

        let mut connections = Vec::new();
        let mut missing_connections = Vec::new();
        let mut seen = HashSet::new();
        for entry in &stored.destinations {
            let Some(id) = entry.destination.target.connection_id() else {
                continue;
            };
            if !seen.insert(id.to_string()) {
                continue;
            }
            match self.connections.get(id).await? {
                Some(connection) => connections.push(connection.redacted()),
                None => missing_connections.push(id.to_string()),
            }
        }

        Ok(PolicyConfig {
            policy: stored.policy,
            primary,
            replicas,
            connections,
            missing_connections,
        })
    }
}

/// Trim, lowercase, drop empties and duplicates (first occurrence wins).
pub fn normalize_targets(targets: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    targets
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::destination::DestinationTarget;
    use crate::store::{MemoryBackupStore, MemoryConnectionStore};

    fn service() -> PolicyService {
        PolicyService::new(
            Arc::new(MemoryBackupStore::new()),
            Arc::new(MemoryConnectionStore::new()),
            30,
            3650,
        )
    }

    fn local(name: &str, path: &str) -> Destination {
        Destination::new(name, DestinationTarget::Local { path: path.into() })
    }

    fn update() -> PolicyUpdate {
        PolicyUpdate {
            enabled: true,
            targets: vec![" Users ".into(), "roles".into(), "users".into(), "".into()],
            schedule: ScheduleKind::Daily,
            cron_expression: Some("ignored".into()),
            timezone: None,
            run_hour: None,
            run_weekday: None,
            retention_days: Some(14),
            encrypt: false,
            notifications: NotificationChannels::default(),
            min_success: Some(2),
            parallelism: None,
            primary: local("disk", "/var/backups"),
            replicas: vec![
                ReplicaConfig {
                    destination: local("b", "/mnt/b"),
                    priority: None,
                },
                ReplicaConfig {
                    destination: local("a", "/mnt/a"),
                    priority: Some(1),
                },
            ],
        }
    }

    #[test]
    fn test_normalize_targets_dedupes() {
        assert_eq!(
            normalize_targets(&[" Users ".into(), "roles".into(), "users".into(), "".into()]),
            vec!["users".to_string(), "roles".to_string()]
        );
    }

    #[test]
    fn test_normalize_assigns_and_sorts_priorities() {
        let (policy, destinations) = service().normalize(update()).unwrap();
        assert_eq!(policy.targets, vec!["users", "roles"]);
        assert!(policy.cron_expression.is_none());
        assert_eq!(policy.timezone, "UTC");
        let names: Vec<_> = destinations
            .iter()
            .map(|d| (d.destination.name.as_str(), d.priority))
            .collect();
        // "b" defaults to position 1, ties broken by name.
        assert_eq!(names, vec![("disk", 0), ("a", 1), ("b", 1)]);
    }

    #[test]
    fn test_min_success_above_destination_count_rejected() {
        let mut u = update();
        u.min_success = Some(4);
        assert!(service().normalize(u).is_err());
    }

    #[test]
    fn test_retention_bounds() {
        let mut u = update();
        u.retention_days = Some(0);
        assert!(service().normalize(u).is_err());
        let mut u = update();
        u.retention_days = Some(3651);
        assert!(service().normalize(u).is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut u = update();
        u.replicas[0].destination.name = "disk".into();
        let err = service().normalize(u).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_cron_schedule_requires_valid_expression() {
        let mut u = update();
        u.schedule = ScheduleKind::Cron;
        u.cron_expression = Some("every day".into());
        assert!(service().normalize(u).is_err());

        let mut u = update();
        u.schedule = ScheduleKind::Cron;
        u.cron_expression = Some(" 0 3 * * * ".into());
        let (policy, _) = service().normalize(u).unwrap();
        assert_eq!(policy.cron_expression.as_deref(), Some("0 3 * * *"));
    }

    #[test]
    fn test_replica_validated_independently() {
        let mut u = update();
        u.replicas[1].destination = local("a", "relative/path");
        let err = service().normalize(u).unwrap_err();
        assert!(err.to_string().contains("destination 'a'"));
    }

    #[tokio::test]
    async fn test_get_config_defaults_when_unsaved() {
        let config = service().get_config().await.unwrap();
        assert!(!config.policy.enabled);
        assert!(config.primary.is_none());
        assert_eq!(config.policy.retention_days, 30);
    }
}
