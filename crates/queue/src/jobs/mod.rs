//! Scheduled job records.

#![allow(missing_docs)]

use std::fmt;

use cadence_core::WorkItemId;
use serde::{Deserialize, Serialize};

/// Priority used when the caller has no preference.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Identity of one schedule of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(String);

impl ScheduleId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a scheduled job sits in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for its due time, or due and not yet claimed.
    Delayed,
    /// Claimed by a worker.
    Active,
    /// Finished successfully; retained for inspection.
    Completed,
    /// Finished with a failure; retained for inspection.
    Failed,
}

impl JobState {
    /// Name used in the store.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a stored state name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "delayed" => Some(Self::Delayed),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A pending, running or retained execution of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub id: ScheduleId,
    pub work_item_id: WorkItemId,
    pub due_at_ms: i64,
    /// Lower runs first among jobs claimed together.
    pub priority: u8,
    pub enqueued_at_ms: i64,
    pub state: JobState,
    pub claimed_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
    pub error: Option<String>,
}

impl ScheduledJob {
    /// A new job waiting for `due_at_ms`.
    #[must_use]
    pub const fn delayed(
        id: ScheduleId,
        work_item_id: WorkItemId,
        due_at_ms: i64,
        priority: u8,
        enqueued_at_ms: i64,
    ) -> Self {
        Self {
            id,
            work_item_id,
            due_at_ms,
            priority,
            enqueued_at_ms,
            state: JobState::Delayed,
            claimed_at_ms: None,
            finished_at_ms: None,
            error: None,
        }
    }
}

/// How a claimed job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
}

impl JobOutcome {
    /// Terminal state this outcome moves the job into.
    #[must_use]
    pub const fn state(&self) -> JobState {
        match self {
            Self::Completed => JobState::Completed,
            Self::Failed(_) => JobState::Failed,
        }
    }

    /// Failure detail, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Completed => None,
            Self::Failed(error) => Some(error),
        }
    }
}
