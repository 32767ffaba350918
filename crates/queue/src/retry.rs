//! Retry with exponential backoff and jitter.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use cadence_common::RetrySettings;
use cadence_core::PublishError;
use rand::Rng;
use tracing::{debug, warn};

use crate::rate_limit::{PlatformRateLimiter, RateLimitKey};

/// HTTP statuses worth retrying.
const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Message fragments that mark an error as transient.
const RETRYABLE_PATTERNS: [&str; 8] = [
    "rate limit",
    "too many requests",
    "timeout",
    "timed out",
    "connection reset",
    "econnreset",
    "etimedout",
    "temporarily unavailable",
];

/// Backoff parameters for one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound for the exponential part of the delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay after the given failed attempt (0-indexed), capped
    /// at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// [`Self::delay_for_attempt`] plus up to 25% of it in random jitter.
    pub fn delay_with_jitter<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let capped = self.delay_for_attempt(attempt);
        let max_jitter = u64::try_from(capped.as_millis() / 4).unwrap_or(u64::MAX);
        capped + Duration::from_millis(rng.gen_range(0..=max_jitter))
    }

    /// Check if another attempt follows the given failed attempt (0-indexed).
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

/// Classification of an error for retry purposes.
pub trait Retryable {
    /// Whether trying again may succeed.
    fn is_retryable(&self) -> bool;

    /// Minimum wait requested by the remote side.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Whether an error message describes a transient failure.
#[must_use]
pub fn is_retryable_message(message: &str) -> bool {
    let message = message.to_lowercase();
    RETRYABLE_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

impl Retryable for PublishError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Transient(_) => true,
            Self::Http { status, message } => {
                RETRYABLE_STATUSES.contains(status) || is_retryable_message(message)
            }
            Self::AuthExpired(_) | Self::BadRequest(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

type RetryHook<'a, E> = Box<dyn FnMut(u32, &E) + Send + 'a>;
type Classifier<'a, E> = Box<dyn Fn(&E) -> bool + Send + Sync + 'a>;

/// Runs an operation until it succeeds, fails permanently, or exhausts its
/// attempts.
///
/// ```ignore
/// let post = Retrier::new(policy)
///     .pace_with(&limiter, RateLimitKey::post("mastodon", "acct-1"))
///     .on_retry(|attempt, err| warn!(attempt, error = %err, "retrying"))
///     .run(|| publisher.post(account, token, &content))
///     .await?;
/// ```
pub struct Retrier<'a, E> {
    policy: RetryPolicy,
    pacing: Option<(&'a PlatformRateLimiter, RateLimitKey)>,
    on_retry: Option<RetryHook<'a, E>>,
    classifier: Option<Classifier<'a, E>>,
}

impl<'a, E> Retrier<'a, E>
where
    E: Retryable + fmt::Display,
{
    /// Create a retrier with the given policy.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pacing: None,
            on_retry: None,
            classifier: None,
        }
    }

    /// Wait for the rate limiter before every attempt.
    #[must_use]
    pub fn pace_with(mut self, limiter: &'a PlatformRateLimiter, key: RateLimitKey) -> Self {
        self.pacing = Some((limiter, key));
        self
    }

    /// Called after each backoff sleep with the number of the upcoming retry
    /// (starting at 1) and the error that caused it.
    #[must_use]
    pub fn on_retry(mut self, hook: impl FnMut(u32, &E) + Send + 'a) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    /// Replace [`Retryable::is_retryable`] as the retry decision.
    #[must_use]
    pub fn with_classifier(mut self, classifier: impl Fn(&E) -> bool + Send + Sync + 'a) -> Self {
        self.classifier = Some(Box::new(classifier));
        self
    }

    /// Run `operation`, returning its first success or its last error.
    pub async fn run<T, F, Fut>(mut self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if let Some((limiter, key)) = &self.pacing {
                limiter.wait_for_rate_limit(key).await;
            }

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let retryable = self
                .classifier
                .as_ref()
                .map_or_else(|| err.is_retryable(), |classify| classify(&err));
            if !retryable {
                debug!(attempt, error = %err, "Non-retryable error");
                return Err(err);
            }
            if attempt + 1 >= max_attempts {
                warn!(attempts = max_attempts, error = %err, "Retry attempts exhausted");
                return Err(err);
            }

            let backoff = {
                let mut rng = rand::thread_rng();
                self.policy.delay_with_jitter(attempt, &mut rng)
            };
            let delay = err.retry_after().map_or(backoff, |after| after.max(backoff));
            debug!(attempt, delay = ?delay, error = %err, "Retrying after backoff");
            tokio::time::sleep(delay).await;

            attempt += 1;
            if let Some(hook) = self.on_retry.as_mut() {
                hook(attempt, &err);
            }
        }
    }
}

/// Run `operation` under `policy` with the default retry classification.
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, operation: F) -> Result<T, E>
where
    E: Retryable + fmt::Display,
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send,
{
    Retrier::new(policy).run(operation).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }

    fn unavailable() -> PublishError {
        PublishError::Http {
            status: 503,
            message: "Service Unavailable".to_string(),
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = policy(10);

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(32));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_is_monotonic_and_jitter_is_additive() {
        let policy = policy(10);
        let mut rng = StdRng::seed_from_u64(7);

        let mut previous = Duration::ZERO;
        for attempt in 0..20 {
            let capped = policy.delay_for_attempt(attempt);
            assert!(capped >= previous);
            assert!(capped <= policy.max_delay);
            previous = capped;

            for _ in 0..50 {
                let jittered = policy.delay_with_jitter(attempt, &mut rng);
                assert!(jittered >= capped);
                assert!(jittered <= capped + capped / 4);
            }
        }
    }

    #[test]
    fn test_should_retry() {
        let policy = policy(3);

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn test_publish_error_classification() {
        assert!(unavailable().is_retryable());
        assert!(PublishError::Transient("connection reset by peer".to_string()).is_retryable());
        assert!(
            PublishError::RateLimited {
                message: "slow down".to_string(),
                retry_after: None
            }
            .is_retryable()
        );
        assert!(
            PublishError::Http {
                status: 400,
                message: "Too Many Requests for this app".to_string()
            }
            .is_retryable()
        );

        assert!(!PublishError::Http {
            status: 404,
            message: "Not Found".to_string()
        }
        .is_retryable());
        assert!(!PublishError::BadRequest("text too long".to_string()).is_retryable());
        assert!(!PublishError::AuthExpired("revoked".to_string()).is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_makes_one_attempt() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(policy(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PublishError::BadRequest("invalid media".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(PublishError::BadRequest(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_max_attempts_minus_one_failures() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();

        let result = Retrier::new(policy(4))
            .on_retry(|attempt, _err: &PublishError| retries.push(attempt))
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 3 { Err(unavailable()) } else { Ok("posted") } }
            })
            .await;

        assert_eq!(result.unwrap(), "posted");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(retries, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(policy(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(PublishError::Transient(format!("timeout #{n}"))) }
        })
        .await;

        assert_eq!(result, Err(PublishError::Transient("timeout #2".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let started = tokio::time::Instant::now();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = with_retry(policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(unavailable()) }
        })
        .await;

        assert!(result.is_err());
        // 1s + 2s of backoff, each with at most 25% jitter.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed <= Duration::from_millis(3_750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_extends_backoff() {
        let started = tokio::time::Instant::now();
        let calls = AtomicU32::new(0);

        let result = with_retry(policy(2), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(PublishError::RateLimited {
                        message: "quota".to_string(),
                        retry_after: Some(Duration::from_secs(30)),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(1));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = Retrier::new(policy(5))
            .with_classifier(|_err: &PublishError| false)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(unavailable()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
