//! In-process store.
//!
//! Holds everything behind one async mutex, which makes each operation
//! atomic for every worker in the process. Used in tests and single-node
//! deployments without Redis.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use cadence_core::WorkItemId;
use tokio::sync::Mutex;

use super::{QueueCounts, STALLED_ERROR, SharedStore, StoreError, WindowDecision};
use crate::jobs::{JobOutcome, JobState, ScheduleId, ScheduledJob};

#[derive(Default)]
struct State {
    windows: HashMap<String, VecDeque<i64>>,
    jobs: HashMap<ScheduleId, ScheduledJob>,
    pending: HashMap<WorkItemId, ScheduleId>,
}

impl State {
    fn prune_window(&mut self, key: &str, window_ms: u64, now_ms: i64) -> usize {
        let Some(entries) = self.windows.get_mut(key) else {
            return 0;
        };
        let cutoff = now_ms.saturating_sub(i64::try_from(window_ms).unwrap_or(i64::MAX));
        while entries.front().is_some_and(|&at| at < cutoff) {
            entries.pop_front();
        }
        let len = entries.len();
        if len == 0 {
            self.windows.remove(key);
        }
        len
    }

    fn remove_pending(&mut self, id: &ScheduleId) -> Option<ScheduledJob> {
        if self.jobs.get(id)?.state != JobState::Delayed {
            return None;
        }
        let job = self.jobs.remove(id)?;
        if self.pending.get(&job.work_item_id) == Some(id) {
            self.pending.remove(&job.work_item_id);
        }
        Some(job)
    }
}

/// [`SharedStore`] kept in process memory.
pub struct MemoryStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty, available store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn window_acquire(
        &self,
        key: &str,
        capacity: u32,
        window_ms: u64,
        now_ms: i64,
    ) -> Result<WindowDecision, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;

        let count = state.prune_window(key, window_ms, now_ms);
        if count >= capacity.max(1) as usize {
            let oldest = state
                .windows
                .get(key)
                .and_then(|entries| entries.front().copied())
                .unwrap_or(now_ms);
            // The oldest entry still counts at exactly `oldest + window`.
            let leaves_at = oldest
                .saturating_add(i64::try_from(window_ms).unwrap_or(i64::MAX))
                .saturating_add(1);
            let wait_ms = u64::try_from(leaves_at - now_ms).unwrap_or(0).max(1);
            return Ok(WindowDecision::Limited { wait_ms });
        }

        state
            .windows
            .entry(key.to_string())
            .or_default()
            .push_back(now_ms);
        Ok(WindowDecision::Allowed)
    }

    async fn window_count(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: i64,
    ) -> Result<u32, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let count = state.prune_window(key, window_ms, now_ms);
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn window_clear(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.state.lock().await.windows.remove(key);
        Ok(())
    }

    async fn schedule(&self, job: &ScheduledJob) -> Result<Option<ScheduleId>, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;

        let replaced = state
            .pending
            .get(&job.work_item_id)
            .cloned()
            .and_then(|previous| state.remove_pending(&previous))
            .map(|previous| previous.id);

        state
            .pending
            .insert(job.work_item_id.clone(), job.id.clone());
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(replaced)
    }

    async fn cancel(&self, id: &ScheduleId) -> Result<bool, StoreError> {
        self.ensure_available()?;
        Ok(self.state.lock().await.remove_pending(id).is_some())
    }

    async fn cancel_work_item(
        &self,
        work_item_id: &WorkItemId,
    ) -> Result<Option<ScheduleId>, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let Some(id) = state.pending.get(work_item_id).cloned() else {
            return Ok(None);
        };
        Ok(state.remove_pending(&id).map(|job| job.id))
    }

    async fn claim_due(&self, now_ms: i64, limit: usize) -> Result<Vec<ScheduledJob>, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;

        let mut due: Vec<(i64, u8, ScheduleId)> = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Delayed && job.due_at_ms <= now_ms)
            .map(|job| (job.due_at_ms, job.priority, job.id.clone()))
            .collect();
        due.sort_unstable();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            job.state = JobState::Active;
            job.claimed_at_ms = Some(now_ms);
            let job = job.clone();
            if state.pending.get(&job.work_item_id) == Some(&id) {
                state.pending.remove(&job.work_item_id);
            }
            claimed.push(job);
        }
        Ok(claimed)
    }

    async fn finish(
        &self,
        id: &ScheduleId,
        outcome: &JobOutcome,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(id) else {
            return Ok(false);
        };
        if job.state != JobState::Active {
            return Ok(false);
        }
        job.state = outcome.state();
        job.finished_at_ms = Some(now_ms);
        job.error = outcome.error().map(str::to_string);
        Ok(true)
    }

    async fn reap_stalled(
        &self,
        claimed_before_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;

        let mut reaped = Vec::new();
        for job in state.jobs.values_mut() {
            let stalled = job.state == JobState::Active
                && job.claimed_at_ms.is_some_and(|at| at <= claimed_before_ms);
            if stalled {
                job.state = JobState::Failed;
                job.finished_at_ms = Some(now_ms);
                job.error = Some(STALLED_ERROR.to_string());
                reaped.push(job.clone());
            }
        }
        Ok(reaped)
    }

    async fn purge_finished(
        &self,
        completed_before_ms: i64,
        failed_before_ms: i64,
    ) -> Result<u64, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;

        let before = state.jobs.len();
        state.jobs.retain(|_, job| match (job.state, job.finished_at_ms) {
            (JobState::Completed, Some(at)) => at >= completed_before_ms,
            (JobState::Failed, Some(at)) => at >= failed_before_ms,
            _ => true,
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn counts(&self, now_ms: i64) -> Result<QueueCounts, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;

        let mut counts = QueueCounts::default();
        for job in state.jobs.values() {
            match job.state {
                JobState::Delayed if job.due_at_ms <= now_ms => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn get_job(&self, id: &ScheduleId) -> Result<Option<ScheduledJob>, StoreError> {
        self.ensure_available()?;
        Ok(self.state.lock().await.jobs.get(id).cloned())
    }
}
