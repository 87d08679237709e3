use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::{SyncService, TriggerAck};

/// Cron-driven triggers into [`SyncService::trigger`]. Independent of the
/// control-surface server; dropping it without `shutdown` leaves jobs running.
pub struct SyncScheduler {
    scheduler: JobScheduler,
    cron: String,
}

impl SyncScheduler {
    /// Six-field cron expression evaluated in UTC.
    pub async fn start(service: Arc<SyncService>, cron: &str) -> Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                match service.trigger(false).await {
                    Ok(TriggerAck::Started { run_id, sync_date }) => {
                        info!(%run_id, %sync_date, "scheduled sync started");
                    }
                    Ok(ack) => info!(?ack, "scheduled sync not started"),
                    Err(err) => error!(error = %err, "scheduled sync could not start"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        scheduler.add(job).await.context("adding scheduler job")?;
        scheduler.start().await.context("starting scheduler")?;
        info!(cron, "sync scheduler started");
        Ok(Self {
            scheduler,
            cron: cron.to_string(),
        })
    }

    /// Starts only when `scheduler_enabled` is set in the service config.
    pub async fn maybe_start(service: Arc<SyncService>) -> Result<Option<Self>> {
        if !service.config().scheduler_enabled {
            return Ok(None);
        }
        let cron = service.config().sync_cron.clone();
        Self::start(service, &cron).await.map(Some)
    }

    pub fn cron(&self) -> &str {
        &self.cron
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.scheduler.shutdown().await.context("stopping scheduler")?;
        info!(cron = %self.cron, "sync scheduler stopped");
        Ok(())
    }
}
