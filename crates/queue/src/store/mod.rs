//! Shared state behind the scheduler and the rate limiter.
//!
//! Every operation is a single atomic read-modify-write against the store, so
//! two workers never claim the same job and two limiters never both take the
//! last slot of a window.

mod memory;
mod redis;

use async_trait::async_trait;
use cadence_common::AppError;
use cadence_core::WorkItemId;
use serde::Serialize;
use thiserror::Error;

use crate::jobs::{JobOutcome, ScheduleId, ScheduledJob};

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Errors raised by a [`SharedStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected a command.
    #[error("redis error: {0}")]
    Redis(String),

    /// A stored record could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) | StoreError::Redis(msg) => Self::Redis(msg),
            StoreError::Serialization(msg) => Self::Queue(msg),
        }
    }
}

/// Result of trying to take a slot in a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// A slot was recorded at the current time.
    Allowed,
    /// The window is full; the oldest entry leaves it after `wait_ms`.
    Limited { wait_ms: u64 },
}

/// Job counts by queue position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    /// Due and not yet claimed.
    pub waiting: u64,
    /// Claimed and running.
    pub active: u64,
    /// Retained successful jobs.
    pub completed: u64,
    /// Retained failed jobs.
    pub failed: u64,
    /// Not yet due.
    pub delayed: u64,
}

/// Atomic operations over the shared counter and queue store.
///
/// Times are Unix milliseconds supplied by the caller's clock.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Drop entries before `now_ms - window_ms`, then record `now_ms` if
    /// fewer than `capacity` entries remain in `[now_ms - window_ms, now_ms]`.
    async fn window_acquire(
        &self,
        key: &str,
        capacity: u32,
        window_ms: u64,
        now_ms: i64,
    ) -> Result<WindowDecision, StoreError>;

    /// Entries currently inside the window.
    async fn window_count(&self, key: &str, window_ms: u64, now_ms: i64)
        -> Result<u32, StoreError>;

    /// Forget every entry of a window.
    async fn window_clear(&self, key: &str) -> Result<(), StoreError>;

    /// Insert a delayed job, first removing any pending job for the same work
    /// item. Returns the id of the replaced job.
    async fn schedule(&self, job: &ScheduledJob) -> Result<Option<ScheduleId>, StoreError>;

    /// Remove a pending job. Returns `false` if it was not pending.
    async fn cancel(&self, id: &ScheduleId) -> Result<bool, StoreError>;

    /// Remove the pending job for a work item, returning its id.
    async fn cancel_work_item(
        &self,
        work_item_id: &WorkItemId,
    ) -> Result<Option<ScheduleId>, StoreError>;

    /// Move up to `limit` jobs due at `now_ms` to active, chosen by
    /// `(due_at_ms, priority, id)` so priority decides among jobs due together.
    async fn claim_due(&self, now_ms: i64, limit: usize) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Move an active job to its terminal state. Returns `false` if the job
    /// was not active.
    async fn finish(
        &self,
        id: &ScheduleId,
        outcome: &JobOutcome,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    /// Fail every active job claimed at or before `claimed_before_ms`.
    async fn reap_stalled(
        &self,
        claimed_before_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Delete retained jobs that finished before the given cutoffs.
    async fn purge_finished(
        &self,
        completed_before_ms: i64,
        failed_before_ms: i64,
    ) -> Result<u64, StoreError>;

    /// Job counts as of `now_ms`.
    async fn counts(&self, now_ms: i64) -> Result<QueueCounts, StoreError>;

    /// Look up a pending, active or retained job.
    async fn get_job(&self, id: &ScheduleId) -> Result<Option<ScheduledJob>, StoreError>;
}

/// Message stored on jobs failed by stall reaping.
pub const STALLED_ERROR: &str = "job stalled: worker did not report an outcome";
