//! Backup Orchestrator - Main Entry Point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use backup_orchestrator_backend::{
    api,
    config::Config,
    db,
    error::Result,
    services::{
        backup_service::{BackupService, ControlSettings},
        backup_worker::BackupWorker,
        metrics_service,
        notification_service::Notifier,
        policy_service::PolicyService,
        scheduler_service::{self, Scheduler},
    },
    storage::DefaultAdapterFactory,
    store::{
        BackupStore, ConnectionStore, DataExporter, MemoryBackupStore, MemoryConnectionStore,
        MemoryDataExporter, PgBackupStore, PgConnectionStore, PgDataExporter,
    },
    telemetry,
};

type Stores = (
    Arc<dyn BackupStore>,
    Arc<dyn ConnectionStore>,
    Arc<dyn DataExporter>,
);

async fn open_stores(config: &Config) -> Result<Stores> {
    match &config.database_url {
        Some(url) => {
            let pool = db::connect(url).await?;
            let org = config.organization_id.clone();
            Ok((
                Arc::new(PgBackupStore::new(pool.clone(), org.clone())),
                Arc::new(PgConnectionStore::new(pool.clone(), org.clone())),
                Arc::new(PgDataExporter::new(pool, org)),
            ))
        }
        None => {
            tracing::warn!("DATABASE_URL is not set, using the in-memory store (state is lost on restart)");
            Ok((
                Arc::new(MemoryBackupStore::new()),
                Arc::new(MemoryConnectionStore::new()),
                Arc::new(MemoryDataExporter::new()),
            ))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    telemetry::init_tracing();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!(organization = %config.organization_id, "Starting Backup Orchestrator");

    let (store, connections, exporter) = open_stores(&config).await?;

    let adapters = Arc::new(DefaultAdapterFactory::new(
        connections.clone(),
        Duration::from_secs(config.presign_expiry_secs),
    )?);
    let notifier = Arc::new(Notifier::new(config.notifications.clone()));

    let worker = Arc::new(BackupWorker::new(
        store.clone(),
        adapters.clone(),
        exporter,
        notifier,
        config.scratch_dir.clone(),
        config.encryption_key.clone(),
    ));
    let backups = Arc::new(BackupService::new(
        store.clone(),
        adapters,
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
        connections,
        config.default_retention_days,
        config.max_retention_days,
    ));
    let scheduler = Arc::new(Scheduler::new(
        store,
        worker.clone(),
        Duration::from_secs(config.scheduler_interval_secs),
        Duration::from_secs(config.debounce_secs),
    ));

    // Initialize Prometheus metrics recorder
    let metrics_handle = metrics_service::init_metrics()?;
    tracing::info!("Prometheus metrics recorder initialized");

    let mut app_state = api::AppState::new(config.clone(), backups.clone(), policies);
    app_state.set_metrics_handle(metrics_handle);
    let state = Arc::new(app_state);

    // Spawn background loops (scheduler, worker pump, retention sweep)
    scheduler_service::spawn_all(scheduler, worker, backups, &config);

    // Build router
    let app = Router::new()
        .merge(api::routes::create_router(state))
        .layer(axum::middleware::from_fn(
            metrics_service::metrics_middleware,
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
