//! Platform publisher boundary.
//!
//! Each target platform provides a [`Publisher`]. Request formatting and
//! authorization flows live in those implementations; the pipeline only
//! sees the two calls below and their error kinds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{NewCredentials, PostContent, PublishedPost};

/// Errors reported by [`Publisher::post`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The access token is invalid or expired.
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    /// The platform refused the request because of its own rate limits.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// Platform-provided hint for when to try again.
        retry_after: Option<Duration>,
    },

    /// Non-success HTTP response not covered by a more specific kind.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Connection reset, timeout, or similar network failure.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The platform rejected the payload.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl PublishError {
    /// Whether this is an authentication-class failure.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::AuthExpired(_))
    }
}

/// Errors reported by [`Publisher::refresh_token`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// The platform rejected the refresh token.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// The account has no stored refresh token.
    #[error("no refresh token stored")]
    NoRefreshToken,
}

/// Publishing capability for one platform.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish content to an account.
    async fn post(
        &self,
        account_id: &str,
        access_token: &str,
        content: &PostContent,
    ) -> Result<PublishedPost, PublishError>;

    /// Exchange a refresh token for new credentials.
    async fn refresh_token(&self, refresh_token: &str) -> Result<NewCredentials, RefreshError>;
}

/// Publishers keyed by platform name.
#[derive(Clone, Default)]
pub struct PublisherRegistry {
    publishers: HashMap<String, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a publisher for a platform, replacing any previous one.
    #[must_use]
    pub fn with(mut self, platform: impl Into<String>, publisher: Arc<dyn Publisher>) -> Self {
        self.register(platform, publisher);
        self
    }

    /// Register a publisher for a platform, replacing any previous one.
    pub fn register(&mut self, platform: impl Into<String>, publisher: Arc<dyn Publisher>) {
        self.publishers.insert(platform.into(), publisher);
    }

    /// Look up the publisher for a platform.
    #[must_use]
    pub fn get(&self, platform: &str) -> Option<Arc<dyn Publisher>> {
        self.publishers.get(platform).cloned()
    }

    /// Registered platform names.
    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.publishers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for PublisherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut platforms: Vec<_> = self.platforms().collect();
        platforms.sort_unstable();
        f.debug_struct("PublisherRegistry")
            .field("platforms", &platforms)
            .finish()
    }
}
