//! Bounded pool of job executions.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

use crate::jobs::{JobOutcome, ScheduledJob};
use crate::scheduler::JobScheduler;

/// Executes claimed jobs.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Run a claimed job once.
    async fn execute(&self, job: &ScheduledJob) -> JobOutcome;

    /// Called for a job that was failed because its worker stalled.
    async fn abandon(&self, _job: &ScheduledJob) {}
}

/// Polls the scheduler and runs due jobs with bounded concurrency.
pub struct WorkerPool<H> {
    scheduler: Arc<JobScheduler>,
    handler: Arc<H>,
    semaphore: Arc<Semaphore>,
}

impl<H: JobHandler> WorkerPool<H> {
    /// Create a pool sized by the scheduler's concurrency setting.
    #[must_use]
    pub fn new(scheduler: Arc<JobScheduler>, handler: Arc<H>) -> Self {
        let concurrency = scheduler.settings().concurrency.max(1);
        Self {
            scheduler,
            handler,
            semaphore: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Run until `shutdown` turns true or its sender is dropped, then wait
    /// for in-flight jobs to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let settings = self.scheduler.settings();
        let mut poll = interval(settings.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut maintenance = interval(settings.maintenance_interval());
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();

        info!(concurrency = settings.concurrency, "Worker pool starting");

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = poll.tick() => self.dispatch(&mut tasks).await,
                _ = maintenance.tick() => self.maintain().await,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
            }
        }

        info!(in_flight = tasks.len(), "Worker pool draining");
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        info!("Worker pool stopped");
    }

    async fn dispatch(&self, tasks: &mut JoinSet<()>) {
        let free = self.semaphore.available_permits();
        if free == 0 {
            return;
        }

        let jobs = match self.scheduler.claim_due(free).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to claim due jobs");
                return;
            }
        };

        for job in jobs {
            let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                return;
            };
            let scheduler = self.scheduler.clone();
            let handler = self.handler.clone();

            tasks.spawn(async move {
                let _permit = permit;
                debug!(schedule_id = %job.id, work_item_id = %job.work_item_id, "Executing job");
                let outcome = handler.execute(&job).await;
                if let Err(e) = scheduler.complete(&job.id, &outcome).await {
                    error!(schedule_id = %job.id, error = %e, "Failed to record job outcome");
                }
            });
        }
    }

    async fn maintain(&self) {
        match self.scheduler.reap_stalled().await {
            Ok(stalled) => {
                for job in &stalled {
                    self.handler.abandon(job).await;
                }
            }
            Err(e) => error!(error = %e, "Failed to reap stalled jobs"),
        }

        if let Err(e) = self.scheduler.purge_finished().await {
            error!(error = %e, "Failed to purge finished jobs");
        }
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Job task panicked");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::jobs::JobState;
    use crate::store::MemoryStore;
    use cadence_common::{PipelineMetrics, SchedulerSettings};
    use cadence_core::WorkItemId;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct SlowHandler {
        running: AtomicUsize,
        peak: AtomicUsize,
        executed: std::sync::Mutex<Vec<WorkItemId>>,
        abandoned: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn execute(&self, job: &ScheduledJob) -> JobOutcome {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(2)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.executed.lock().unwrap().push(job.work_item_id.clone());
            JobOutcome::Completed
        }

        async fn abandon(&self, _job: &ScheduledJob) {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scheduler(concurrency: usize) -> Arc<JobScheduler> {
        let settings = SchedulerSettings {
            concurrency,
            poll_interval_ms: 100,
            ..SchedulerSettings::default()
        };
        Arc::new(JobScheduler::new(
            Arc::new(MemoryStore::new()),
            Arc::new(TokioClock::new()),
            Arc::new(PipelineMetrics::new()),
            settings,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bounds_concurrency_and_runs_each_job_once() {
        let scheduler = scheduler(2);
        let handler = Arc::new(SlowHandler::default());
        let due = scheduler.clock().now() + ChronoDuration::seconds(1);
        for i in 0..5 {
            scheduler
                .schedule(&WorkItemId::for_post(&i.to_string()), due, 5)
                .await
                .unwrap();
        }

        let pool = Arc::new(WorkerPool::new(scheduler.clone(), handler.clone()));
        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(20)).await;
        tx.send(true).unwrap();
        running.await.unwrap();

        assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
        let mut executed = handler.executed.lock().unwrap().clone();
        executed.sort();
        executed.dedup();
        assert_eq!(executed.len(), 5);
        assert_eq!(scheduler.metrics().await.unwrap().completed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_in_flight_jobs() {
        let scheduler = scheduler(4);
        let handler = Arc::new(SlowHandler::default());
        let due = scheduler.clock().now() + ChronoDuration::milliseconds(50);
        let id = scheduler
            .schedule(&WorkItemId::for_post("1"), due, 5)
            .await
            .unwrap();

        let pool = Arc::new(WorkerPool::new(scheduler.clone(), handler.clone()));
        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run(rx).await }
        });

        // Long enough for a poll to claim, shorter than the job.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(handler.running.load(Ordering::SeqCst), 1);
        tx.send(true).unwrap();
        running.await.unwrap();

        assert_eq!(handler.running.load(Ordering::SeqCst), 0);
        let job = scheduler.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }
}
