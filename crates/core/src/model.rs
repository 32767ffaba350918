//! Domain model for scheduled publishing.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a work item.
///
/// Derived from the business record it publishes, so scheduling the same
/// record twice always targets the same work item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(String);

impl WorkItemId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Work item identity for a post.
    #[must_use]
    pub fn for_post(post_id: &str) -> Self {
        Self(format!("post:{post_id}"))
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkItemId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    /// Waiting for its scheduled time.
    Queued,
    /// Claimed by a worker.
    Running,
    /// Published to the platform.
    Published,
    /// Terminal failure; `last_error` carries the detail.
    Failed,
}

impl WorkStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Published | Self::Failed)
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Published => "PUBLISHED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A unit of schedulable publish work tied to one business record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: WorkItemId,
    /// Reference to the business record holding the content.
    pub payload_ref: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: WorkStatus,
    pub last_error: Option<String>,
    pub retry_count: u32,
    /// Platform post id, set once published.
    pub external_id: Option<String>,
    /// Platform post URL, set once published.
    pub url: Option<String>,
}

impl WorkItem {
    /// Create a queued work item.
    #[must_use]
    pub fn queued(id: WorkItemId, payload_ref: impl Into<String>, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payload_ref: payload_ref.into(),
            scheduled_at,
            status: WorkStatus::Queued,
            last_error: None,
            retry_count: 0,
            external_id: None,
            url: None,
        }
    }

    /// Whether a worker may still publish this item.
    #[must_use]
    pub const fn is_publishable(&self) -> bool {
        matches!(self.status, WorkStatus::Queued)
    }
}

/// Extra data persisted together with a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusDetail {
    pub external_id: Option<String>,
    pub url: Option<String>,
    pub last_error: Option<String>,
    /// Retries performed so far; `None` leaves the stored count unchanged.
    pub retry_count: Option<u32>,
}

impl StatusDetail {
    /// Detail for a successful publish.
    #[must_use]
    pub fn published(post: &PublishedPost, retry_count: u32) -> Self {
        Self {
            external_id: Some(post.external_id.clone()),
            url: Some(post.url.clone()),
            last_error: None,
            retry_count: Some(retry_count),
        }
    }

    /// Detail for a failed item that was scheduled again: the retry count
    /// starts over.
    #[must_use]
    pub fn requeued() -> Self {
        Self {
            retry_count: Some(0),
            ..Self::default()
        }
    }

    /// Detail for a terminal failure.
    #[must_use]
    pub fn failed(error: impl Into<String>, retry_count: u32) -> Self {
        Self {
            last_error: Some(error.into()),
            retry_count: Some(retry_count),
            ..Self::default()
        }
    }
}

/// Stored platform credentials for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Set only when automatic recovery is impossible; cleared only by a new
    /// successful authorization or refresh.
    pub needs_manual_reauth: bool,
}

impl Credential {
    /// Credentials from a fresh authorization.
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at: None,
            needs_manual_reauth: false,
        }
    }

    /// Whether the access token is past its expiry at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Apply a successful refresh.
    pub fn apply_refresh(&mut self, refreshed: NewCredentials, now: DateTime<Utc>) {
        self.access_token = refreshed.access_token;
        if let Some(token) = refreshed.refresh_token {
            self.refresh_token = Some(token);
        }
        self.expires_at = refreshed
            .expires_in
            .and_then(|d| Duration::from_std(d).ok())
            .map(|d| now + d);
        self.needs_manual_reauth = false;
    }

    /// Flag the account for manual reauthorization.
    pub fn mark_needs_manual_reauth(&mut self) {
        self.needs_manual_reauth = true;
    }
}

/// Result of exchanging a refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCredentials {
    pub access_token: String,
    /// Rotated refresh token; `None` keeps the current one.
    pub refresh_token: Option<String>,
    pub expires_in: Option<std::time::Duration>,
}

/// Logical media reference attached to a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum MediaRef {
    /// A file already on local disk. Never deleted by cleanup.
    Path(PathBuf),
    /// A remote object fetched into a temporary file.
    Url(String),
}

/// Business record behind a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishPayload {
    pub platform: String,
    pub account_id: String,
    /// Owner of the media, used to namespace temporary files.
    pub owner_id: String,
    pub text: String,
    #[serde(default)]
    pub media: Vec<MediaRef>,
}

/// Content handed to a publisher, with media already resolved to local files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostContent {
    pub text: String,
    pub media: Vec<PathBuf>,
}

/// Platform response to a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedPost {
    pub external_id: String,
    pub url: String,
}
