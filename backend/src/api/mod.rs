//! API module - HTTP handlers and routing.

pub mod download_response;
pub mod handlers;
pub mod openapi;
pub mod routes;

use crate::config::Config;
use crate::services::backup_service::BackupService;
use crate::services::policy_service::PolicyService;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub backups: Arc<BackupService>,
    pub policies: Arc<PolicyService>,
    pub metrics_handle: Option<Arc<PrometheusHandle>>,
}

impl AppState {
    pub fn new(config: Config, backups: Arc<BackupService>, policies: Arc<PolicyService>) -> Self {
        Self {
            config,
            backups,
            policies,
            metrics_handle: None,
        }
    }

    /// Set the Prometheus handle rendered at `/metrics`.
    pub fn set_metrics_handle(&mut self, handle: PrometheusHandle) {
        self.metrics_handle = Some(Arc::new(handle));
    }
}

pub type SharedState = Arc<AppState>;
