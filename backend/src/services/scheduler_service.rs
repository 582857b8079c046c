//! Background loops: schedule ticks, worker pump and retention sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::{interval, Duration};
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::models::job::JobTrigger;
use crate::services::backup_service::BackupService;
use crate::services::backup_worker::BackupWorker;
use crate::services::schedule::CompiledSchedule;
use crate::store::BackupStore;

/// What a single scheduler tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    NoPolicy,
    Disabled,
    NotDue,
    /// Due, but another tick already claimed this window.
    Debounced,
    Created(Uuid),
}

pub struct Scheduler {
    store: Arc<dyn BackupStore>,
    worker: Arc<BackupWorker>,
    window: Duration,
    debounce: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn BackupStore>,
        worker: Arc<BackupWorker>,
        window: Duration,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            worker,
            window,
            debounce,
        }
    }

    /// Evaluate the policy schedule at `now` and enqueue a job when due.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let Some(stored) = self.store.get_policy().await? else {
            return Ok(TickOutcome::NoPolicy);
        };
        let policy = &stored.policy;
        if !policy.enabled {
            return Ok(TickOutcome::Disabled);
        }

        let schedule = CompiledSchedule::from_policy(policy)?;
        if !schedule.is_due(now, policy.last_scheduled_at, self.window) {
            return Ok(TickOutcome::NotDue);
        }

        if !self.store.mark_scheduled_once(now, self.debounce).await? {
            tracing::debug!("Scheduled backup already claimed for this window");
            return Ok(TickOutcome::Debounced);
        }

        let job = self.store.create_job(JobTrigger::Scheduled).await?;
        tracing::info!(job_id = %job.id, schedule = schedule.expression(), "Scheduled backup job created");
        self.worker.trigger();
        Ok(TickOutcome::Created(job.id))
    }
}

/// Spawn the background loops. Fire-and-forget.
pub fn spawn_all(
    scheduler: Arc<Scheduler>,
    worker: Arc<BackupWorker>,
    backups: Arc<BackupService>,
    config: &Config,
) {
    // Schedule evaluation
    {
        let period = Duration::from_secs(config.scheduler_interval_secs);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let mut ticker = interval(period);

            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.tick(Utc::now()).await {
                    tracing::warn!("Backup schedule check failed: {}", e);
                }
            }
        });
    }

    // Worker pump, picks up jobs created while the worker was not triggered
    {
        let period = Duration::from_secs(config.worker_interval_secs);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let mut ticker = interval(period);

            loop {
                ticker.tick().await;
                worker.drain().await;
            }
        });
    }

    // Retention sweep
    if config.retention_sweep_interval_secs > 0 {
        let period = Duration::from_secs(config.retention_sweep_interval_secs);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let mut ticker = interval(period);

            loop {
                ticker.tick().await;
                tracing::debug!("Running backup retention sweep");
                match backups.prune(Utc::now()).await {
                    Ok(report) if report.pruned > 0 => {
                        tracing::info!(
                            "Retention sweep removed {} backup jobs ({} remote artifacts deleted)",
                            report.pruned,
                            report.remote_deleted
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Backup retention sweep failed: {}", e),
                }
            }
        });
    }

    tracing::info!(
        scheduler_interval_secs = config.scheduler_interval_secs,
        worker_interval_secs = config.worker_interval_secs,
        retention_sweep_interval_secs = config.retention_sweep_interval_secs,
        "Backup background loops started"
    );
}
