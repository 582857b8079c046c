//! Common test utilities for backend integration and handler tests
//!
//! This module provides shared infrastructure for testing:
//! - An in-memory engine (store, exporter, connections) wired like `main`
//! - Scripted destination adapters keyed by destination name
//! - A notifier that records what it was asked to send

#![allow(dead_code)]
#![allow(unused_imports)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use tokio::sync::Mutex;
use uuid::Uuid;

use backup_orchestrator_backend::{
    api,
    config::Config,
    error::{AppError, Result},
    models::destination::{Destination, DestinationKind, DestinationTarget},
    models::job::{ArtifactLocation, BackupJob},
    models::policy::{NotificationChannels, ScheduleKind},
    services::{
        backup_service::{BackupService, ControlSettings},
        backup_worker::BackupWorker,
        notification_service::NotificationSink,
        policy_service::{PolicyConfig, PolicyService, PolicyUpdate, ReplicaConfig},
        scheduler_service::Scheduler,
    },
    storage::{AdapterFactory, DestinationAdapter},
    store::{BackupStore, MemoryBackupStore, MemoryConnectionStore, MemoryDataExporter},
};

/// How a scripted destination behaves on upload.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(String),
    /// Succeed after sleeping.
    Slow(Duration),
}

#[derive(Default)]
pub struct ScriptState {
    pub behaviors: HashMap<String, Behavior>,
    /// Destination names in the order uploads started.
    pub attempts: Vec<String>,
    /// Stored objects keyed by location path.
    pub objects: HashMap<String, Bytes>,
    pub deleted: Vec<String>,
}

/// Adapter factory whose adapters follow a per-destination script.
#[derive(Default)]
pub struct ScriptedAdapters {
    pub state: Arc<Mutex<ScriptState>>,
    in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedAdapters {
    pub async fn script(&self, name: &str, behavior: Behavior) {
        self.state
            .lock()
            .await
            .behaviors
            .insert(name.to_string(), behavior);
    }

    pub async fn attempts(&self) -> Vec<String> {
        self.state.lock().await.attempts.clone()
    }

    pub async fn deleted(&self) -> Vec<String> {
        self.state.lock().await.deleted.clone()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct ScriptedAdapter {
    name: String,
    kind: DestinationKind,
    state: Arc<Mutex<ScriptState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

fn location_path(location: &ArtifactLocation) -> String {
    match location {
        ArtifactLocation::Local { path } => path.clone(),
        other => format!("{:?}", other),
    }
}

#[async_trait]
impl DestinationAdapter for ScriptedAdapter {
    fn kind(&self) -> DestinationKind {
        self.kind
    }

    async fn put_object(&self, name: &str, content: Bytes) -> Result<ArtifactLocation> {
        let behavior = {
            let mut state = self.state.lock().await;
            state.attempts.push(self.name.clone());
            state
                .behaviors
                .get(&self.name)
                .cloned()
                .unwrap_or(Behavior::Succeed)
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(msg) => Err(AppError::Storage(msg)),
            Behavior::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result?;

        let path = format!("/scripted/{}/{}", self.name, name);
        self.state
            .lock()
            .await
            .objects
            .insert(path.clone(), content);
        Ok(ArtifactLocation::Local { path })
    }

    async fn read(&self, location: &ArtifactLocation) -> Result<Bytes> {
        let path = location_path(location);
        self.state
            .lock()
            .await
            .objects
            .get(&path)
            .cloned()
            .ok_or(AppError::NotFound(path))
    }

    async fn delete(&self, location: &ArtifactLocation) -> Result<()> {
        let path = location_path(location);
        let mut state = self.state.lock().await;
        state.objects.remove(&path);
        state.deleted.push(path);
        Ok(())
    }
}

#[async_trait]
impl AdapterFactory for ScriptedAdapters {
    async fn adapter_for(&self, destination: &Destination) -> Result<Box<dyn DestinationAdapter>> {
        Ok(Box::new(ScriptedAdapter {
            name: destination.name.clone(),
            kind: destination.kind(),
            state: self.state.clone(),
            in_flight: self.in_flight.clone(),
            max_in_flight: self.max_in_flight.clone(),
        }))
    }

    async fn adapter_for_location(
        &self,
        location: &ArtifactLocation,
    ) -> Result<Box<dyn DestinationAdapter>> {
        Ok(Box::new(ScriptedAdapter {
            name: "by-location".into(),
            kind: location.kind(),
            state: self.state.clone(),
            in_flight: self.in_flight.clone(),
            max_in_flight: self.max_in_flight.clone(),
        }))
    }
}

/// Records every notification instead of sending it.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(NotificationChannels, String, String)>>,
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn send(&self, channels: &NotificationChannels, subject: &str, body: &str) {
        self.sent
            .lock()
            .await
            .push((*channels, subject.to_string(), body.to_string()));
    }
}

/// Fully wired in-memory engine.
pub struct TestEngine {
    pub config: Config,
    pub store: Arc<MemoryBackupStore>,
    pub connections: Arc<MemoryConnectionStore>,
    pub exporter: Arc<MemoryDataExporter>,
    pub adapters: Arc<ScriptedAdapters>,
    pub notifier: Arc<RecordingNotifier>,
    pub worker: Arc<BackupWorker>,
    pub backups: Arc<BackupService>,
    pub policies: Arc<PolicyService>,
    pub scratch: tempfile::TempDir,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let scratch = tempfile::tempdir().expect("scratch dir");
        let mut config = Config::for_tests(scratch.path().join("jobs"));
        adjust(&mut config);

        let store = Arc::new(MemoryBackupStore::new());
        let connections = Arc::new(MemoryConnectionStore::new());
        let exporter = Arc::new(MemoryDataExporter::new());
        let adapters = Arc::new(ScriptedAdapters::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let worker = Arc::new(BackupWorker::new(
            store.clone(),
            adapters.clone(),
            exporter.clone(),
            notifier.clone(),
            config.scratch_dir.clone(),
            config.encryption_key.clone(),
        ));
        let backups = Arc::new(BackupService::new(
            store.clone(),
            adapters.clone(),
            worker.clone(),
            ControlSettings {
                default_retention_days: config.default_retention_days,
                prune_remote_artifacts: config.prune_remote_artifacts,
                allow_restore: config.allow_restore,
                allow_download: config.allow_download,
            },
        ));
        let policies = Arc::new(PolicyService::new(
            store.clone(),
            connections.clone(),
            config.default_retention_days,
            config.max_retention_days,
        ));

        Self {
            config,
            store,
            connections,
            exporter,
            adapters,
            notifier,
            worker,
            backups,
            policies,
            scratch,
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            self.worker.clone(),
            Duration::from_secs(self.config.scheduler_interval_secs),
            Duration::from_secs(self.config.debounce_secs),
        )
    }

    pub fn router(&self) -> Router {
        let state = api::AppState::new(
            self.config.clone(),
            self.backups.clone(),
            self.policies.clone(),
        );
        api::routes::create_router(Arc::new(state))
    }

    /// Give the exporter rows for the `users` target.
    pub async fn seed_users(&self) {
        self.exporter
            .insert_rows(
                "users",
                vec![
                    serde_json::json!({"id": 1, "email": "ada@example.com"}),
                    serde_json::json!({"id": 2, "email": "grace@example.com"}),
                ],
            )
            .await;
    }

    /// Save a policy with a primary and the given replicas.
    pub async fn save_policy(
        &self,
        replicas: &[&str],
        min_success: i32,
        parallelism: i32,
    ) -> PolicyConfig {
        let mut update = policy_update("primary", replicas);
        update.min_success = Some(min_success);
        update.parallelism = Some(parallelism);
        self.policies
            .save_config(update)
            .await
            .expect("policy should save")
    }

    /// Wait until a job leaves the running state.
    pub async fn wait_for_finish(&self, id: Uuid) -> BackupJob {
        for _ in 0..500 {
            let job = self
                .store
                .get_job(id)
                .await
                .expect("store")
                .expect("job exists");
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", id);
    }
}

pub fn local(name: &str) -> Destination {
    Destination::new(
        name,
        DestinationTarget::Local {
            path: format!("/var/backups/{}", name),
        },
    )
}

pub fn policy_update(primary: &str, replicas: &[&str]) -> PolicyUpdate {
    PolicyUpdate {
        enabled: true,
        targets: vec!["users".into(), "devices".into()],
        schedule: ScheduleKind::Daily,
        cron_expression: None,
        timezone: None,
        run_hour: Some(2),
        run_weekday: None,
        retention_days: Some(7),
        encrypt: false,
        notifications: NotificationChannels {
            email: false,
            chat: true,
            webhook: false,
        },
        min_success: Some(1),
        parallelism: Some(2),
        primary: local(primary),
        replicas: replicas
            .iter()
            .map(|name| ReplicaConfig {
                destination: local(name),
                priority: None,
            })
            .collect(),
    }
}
