//! Wiring of the scheduled publish pipeline.

use std::sync::Arc;

use cadence_common::{AppResult, Config, PipelineMetrics};
use cadence_core::{StatusDetail, WorkItemId, WorkItemRepository, WorkStatus};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::clock::{Clock, SystemClock};
use crate::jobs::ScheduleId;
use crate::pool::WorkerPool;
use crate::rate_limit::PlatformRateLimiter;
use crate::retry::RetryPolicy;
use crate::scheduler::JobScheduler;
use crate::store::{RedisStore, SharedStore};
use crate::workers::{PublishWorker, WorkerContext};

/// Scheduler, limiter and worker sharing one store, clock and metrics.
pub struct PublishPipeline {
    scheduler: Arc<JobScheduler>,
    limiter: Arc<PlatformRateLimiter>,
    worker: Arc<PublishWorker>,
    work_items: Arc<dyn WorkItemRepository>,
    metrics: Arc<PipelineMetrics>,
}

impl PublishPipeline {
    /// Assemble a pipeline over an existing store.
    #[must_use]
    pub fn new(
        config: &Config,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        context: WorkerContext,
    ) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let scheduler = Arc::new(JobScheduler::new(
            store.clone(),
            clock.clone(),
            metrics.clone(),
            config.scheduler.clone(),
        ));
        let limiter = Arc::new(PlatformRateLimiter::new(
            store,
            clock.clone(),
            metrics.clone(),
            config.rate_limits.clone(),
        ));
        let work_items = context.work_items.clone();
        let worker = Arc::new(PublishWorker::new(
            context,
            limiter.clone(),
            RetryPolicy::from(&config.retry),
            clock,
            metrics.clone(),
        ));

        Self {
            scheduler,
            limiter,
            worker,
            work_items,
            metrics,
        }
    }

    /// Assemble a pipeline on the configured Redis server.
    pub async fn connect(config: &Config, context: WorkerContext) -> AppResult<Self> {
        config.validate_all()?;
        let store = RedisStore::connect(&config.redis, &config.scheduler.queue).await?;
        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(SystemClock),
            context,
        ))
    }

    /// Schedule a work item for publishing at `due_at`.
    ///
    /// Replaces any pending schedule for the item. A `FAILED` item goes back
    /// to `QUEUED` so the new schedule publishes it; published and running
    /// items are left alone and the new schedule skips them.
    pub async fn schedule(
        &self,
        work_item_id: &WorkItemId,
        due_at: DateTime<Utc>,
        priority: u8,
    ) -> AppResult<ScheduleId> {
        let schedule_id = self.scheduler.schedule(work_item_id, due_at, priority).await?;

        let item = self.work_items.load_work_item(work_item_id).await?;
        if item.is_some_and(|item| item.status == WorkStatus::Failed) {
            self.work_items
                .update_work_item_status(work_item_id, WorkStatus::Queued, StatusDetail::requeued())
                .await?;
            info!(work_item_id = %work_item_id, schedule_id = %schedule_id, "Requeued failed work item");
        }
        Ok(schedule_id)
    }

    /// Scheduling API.
    #[must_use]
    pub const fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Rate limiter shared with the worker.
    #[must_use]
    pub const fn limiter(&self) -> &Arc<PlatformRateLimiter> {
        &self.limiter
    }

    /// Publish worker.
    #[must_use]
    pub const fn worker(&self) -> &Arc<PublishWorker> {
        &self.worker
    }

    /// Pipeline counters.
    #[must_use]
    pub const fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Start the worker pool in the background.
    #[must_use]
    pub fn spawn(&self) -> PipelineHandle {
        let pool = WorkerPool::new(self.scheduler.clone(), self.worker.clone());
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(async move { pool.run(rx).await });
        info!("Publish pipeline started");
        PipelineHandle { shutdown, task }
    }
}

/// Running worker pool.
pub struct PipelineHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    /// Stop claiming new jobs and wait for running ones to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Worker pool task failed");
        }
    }
}
