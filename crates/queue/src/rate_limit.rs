//! Per-platform sliding window rate limiting.
//!
//! Windows live in the [`SharedStore`], keyed by platform, account and
//! operation, so every worker sees the same counts. When the store is
//! unreachable the limiter fails open.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cadence_common::{PipelineMetrics, PlatformLimit};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::store::{SharedStore, WindowDecision};

/// Operation name used for publish calls.
pub const OPERATION_POST: &str = "post";

/// Identity of one rate window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub platform: String,
    pub account: String,
    pub operation: String,
}

impl RateLimitKey {
    /// Create a key.
    pub fn new(
        platform: impl Into<String>,
        account: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            account: account.into(),
            operation: operation.into(),
        }
    }

    /// Key for publishing to an account.
    pub fn post(platform: impl Into<String>, account: impl Into<String>) -> Self {
        Self::new(platform, account, OPERATION_POST)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.platform, self.account, self.operation)
    }
}

/// Rate limit check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request is allowed and has been counted.
    Allowed,
    /// Window is full.
    Limited {
        /// Time until the oldest request leaves the window.
        retry_after: Duration,
    },
}

/// Sliding window limiter shared by all workers.
#[derive(Clone)]
pub struct PlatformRateLimiter {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<PipelineMetrics>,
    limits: HashMap<String, PlatformLimit>,
}

impl PlatformRateLimiter {
    /// Create a limiter with per-platform limits.
    #[must_use]
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<PipelineMetrics>,
        limits: HashMap<String, PlatformLimit>,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
            limits,
        }
    }

    /// Configured limit for a platform.
    #[must_use]
    pub fn limit_for(&self, platform: &str) -> Option<&PlatformLimit> {
        self.limits.get(platform)
    }

    /// Check the window for `key`, counting the request if it is allowed.
    ///
    /// Platforms without a configured limit are always allowed.
    pub async fn check(&self, key: &RateLimitKey) -> RateLimitResult {
        let Some(limit) = self.limits.get(&key.platform) else {
            return RateLimitResult::Allowed;
        };

        let window_ms = u64::try_from(limit.window().as_millis()).unwrap_or(u64::MAX);
        match self
            .store
            .window_acquire(&key.to_string(), limit.capacity, window_ms, self.clock.now_ms())
            .await
        {
            Ok(WindowDecision::Allowed) => RateLimitResult::Allowed,
            Ok(WindowDecision::Limited { wait_ms }) => {
                debug!(key = %key, wait_ms, "Rate window full");
                RateLimitResult::Limited {
                    retry_after: Duration::from_millis(wait_ms),
                }
            }
            Err(e) => {
                PipelineMetrics::incr(&self.metrics.rate_limit_fail_open);
                warn!(key = %key, error = %e, "Rate limit store unavailable, allowing request");
                RateLimitResult::Allowed
            }
        }
    }

    /// Sleep until the window for `key` has room, then count the request.
    ///
    /// Returns the total time spent waiting.
    pub async fn wait_for_rate_limit(&self, key: &RateLimitKey) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            match self.check(key).await {
                RateLimitResult::Allowed => return waited,
                RateLimitResult::Limited { retry_after } => {
                    PipelineMetrics::incr(&self.metrics.rate_limit_waits);
                    debug!(key = %key, retry_after = ?retry_after, "Waiting for rate limit");
                    tokio::time::sleep(retry_after).await;
                    waited += retry_after;
                }
            }
        }
    }

    /// Requests currently counted in the window for `key`.
    pub async fn usage(&self, key: &RateLimitKey) -> Option<u32> {
        let limit = self.limits.get(&key.platform)?;
        let window_ms = u64::try_from(limit.window().as_millis()).unwrap_or(u64::MAX);
        self.store
            .window_count(&key.to_string(), window_ms, self.clock.now_ms())
            .await
            .ok()
    }

    /// Forget all requests counted for `key`.
    pub async fn reset(&self, key: &RateLimitKey) {
        if let Err(e) = self.store.window_clear(&key.to_string()).await {
            warn!(key = %key, error = %e, "Failed to reset rate window");
        }
    }
}
