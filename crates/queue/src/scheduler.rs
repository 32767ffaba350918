//! Durable delayed execution of work items.
//!
//! A work item has at most one pending schedule: scheduling it again replaces
//! the pending one. Claims move jobs to active atomically, so each schedule
//! runs at most once.

use std::sync::Arc;

use cadence_common::{AppError, IdGenerator, PipelineMetrics, SchedulerSettings};
use cadence_core::WorkItemId;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::jobs::{JobOutcome, ScheduleId, ScheduledJob};
use crate::store::{QueueCounts, SharedStore, StoreError};

/// Errors returned by [`JobScheduler`].
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The due time is not strictly after the current time.
    #[error("due time {due_at} is not in the future (now {now})")]
    DueNotInFuture {
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ScheduleError> for AppError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::DueNotInFuture { .. } => Self::Validation(err.to_string()),
            ScheduleError::Store(e) => e.into(),
        }
    }
}

/// Delayed job queue over a [`SharedStore`].
pub struct JobScheduler {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<PipelineMetrics>,
    settings: SchedulerSettings,
    ids: IdGenerator,
}

impl JobScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<PipelineMetrics>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
            settings,
            ids: IdGenerator::new(),
        }
    }

    /// Scheduler settings.
    #[must_use]
    pub const fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Clock used for due times.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Schedule `work_item_id` to run at `due_at`, replacing any pending
    /// schedule for the same work item.
    pub async fn schedule(
        &self,
        work_item_id: &WorkItemId,
        due_at: DateTime<Utc>,
        priority: u8,
    ) -> Result<ScheduleId, ScheduleError> {
        let now_ms = self.clock.now_ms();
        let due_at_ms = due_at.timestamp_millis();
        if due_at_ms <= now_ms {
            return Err(ScheduleError::DueNotInFuture {
                due_at,
                now: self.clock.now(),
            });
        }

        let job = ScheduledJob::delayed(
            ScheduleId::new(self.ids.generate()),
            work_item_id.clone(),
            due_at_ms,
            priority,
            now_ms,
        );
        let replaced = self.store.schedule(&job).await?;
        PipelineMetrics::incr(&self.metrics.jobs_scheduled);

        if let Some(previous) = &replaced {
            PipelineMetrics::incr(&self.metrics.jobs_cancelled);
            info!(
                work_item_id = %work_item_id,
                schedule_id = %job.id,
                replaced = %previous,
                due_at = %due_at,
                "Rescheduled work item"
            );
        } else {
            info!(
                work_item_id = %work_item_id,
                schedule_id = %job.id,
                due_at = %due_at,
                "Scheduled work item"
            );
        }
        Ok(job.id)
    }

    /// Cancel a pending schedule. Returns `false` if it already ran, was
    /// replaced, or never existed.
    pub async fn cancel(&self, id: &ScheduleId) -> Result<bool, ScheduleError> {
        let cancelled = self.store.cancel(id).await?;
        if cancelled {
            PipelineMetrics::incr(&self.metrics.jobs_cancelled);
            info!(schedule_id = %id, "Cancelled schedule");
        } else {
            debug!(schedule_id = %id, "Nothing pending to cancel");
        }
        Ok(cancelled)
    }

    /// Cancel whatever is pending for a work item.
    pub async fn cancel_work_item(
        &self,
        work_item_id: &WorkItemId,
    ) -> Result<Option<ScheduleId>, ScheduleError> {
        let cancelled = self.store.cancel_work_item(work_item_id).await?;
        if let Some(id) = &cancelled {
            PipelineMetrics::incr(&self.metrics.jobs_cancelled);
            info!(work_item_id = %work_item_id, schedule_id = %id, "Cancelled work item schedule");
        }
        Ok(cancelled)
    }

    /// Claim up to `limit` due jobs. The earliest due run first; among jobs
    /// due at the same time the lower priority number wins.
    pub async fn claim_due(&self, limit: usize) -> Result<Vec<ScheduledJob>, ScheduleError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut jobs = self.store.claim_due(self.clock.now_ms(), limit).await?;
        jobs.sort_by(|a, b| {
            (a.due_at_ms, a.priority, &a.id).cmp(&(b.due_at_ms, b.priority, &b.id))
        });

        for job in &jobs {
            PipelineMetrics::incr(&self.metrics.jobs_claimed);
            debug!(schedule_id = %job.id, work_item_id = %job.work_item_id, "Claimed job");
        }
        Ok(jobs)
    }

    /// Record the outcome of a claimed job.
    pub async fn complete(
        &self,
        id: &ScheduleId,
        outcome: &JobOutcome,
    ) -> Result<bool, ScheduleError> {
        let finished = self.store.finish(id, outcome, self.clock.now_ms()).await?;
        if !finished {
            warn!(schedule_id = %id, "Finished a job that was no longer active");
        }
        Ok(finished)
    }

    /// Look up a job while it is pending, running, or retained.
    pub async fn get_job(&self, id: &ScheduleId) -> Result<Option<ScheduledJob>, ScheduleError> {
        Ok(self.store.get_job(id).await?)
    }

    /// Job counts by queue position.
    pub async fn metrics(&self) -> Result<QueueCounts, ScheduleError> {
        Ok(self.store.counts(self.clock.now_ms()).await?)
    }

    /// Fail active jobs whose claim is older than the stall timeout.
    ///
    /// Stalled jobs are not run again.
    pub async fn reap_stalled(&self) -> Result<Vec<ScheduledJob>, ScheduleError> {
        let now_ms = self.clock.now_ms();
        let cutoff = now_ms - duration_ms(self.settings.stall_timeout());
        let reaped = self.store.reap_stalled(cutoff, now_ms).await?;
        for job in &reaped {
            PipelineMetrics::incr(&self.metrics.jobs_stalled);
            warn!(schedule_id = %job.id, work_item_id = %job.work_item_id, "Job stalled");
        }
        Ok(reaped)
    }

    /// Delete retained jobs older than their retention period.
    pub async fn purge_finished(&self) -> Result<u64, ScheduleError> {
        let now_ms = self.clock.now_ms();
        let purged = self
            .store
            .purge_finished(
                now_ms - duration_ms(self.settings.completed_retention()),
                now_ms - duration_ms(self.settings.failed_retention()),
            )
            .await?;
        if purged > 0 {
            debug!(count = purged, "Purged retained jobs");
        }
        Ok(purged)
    }
}

fn duration_ms(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
