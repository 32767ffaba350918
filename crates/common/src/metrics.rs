//! Metrics collection for the publish pipeline.
//!
//! Counters are plain atomics shared through an `Arc`; every component that
//! records metrics receives the same instance at construction time.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Publish pipeline metrics collector.
#[derive(Debug)]
pub struct PipelineMetrics {
    // === Scheduling ===
    /// Schedules accepted.
    pub jobs_scheduled: AtomicU64,
    /// Pending schedules removed by a cancel or a reschedule.
    pub jobs_cancelled: AtomicU64,
    /// Jobs claimed by a worker.
    pub jobs_claimed: AtomicU64,
    /// Claims reaped after exceeding the stall timeout.
    pub jobs_stalled: AtomicU64,

    // === Outcomes ===
    /// Work items published.
    pub publish_succeeded: AtomicU64,
    /// Work items ending in FAILED.
    pub publish_failed: AtomicU64,
    /// Claims that found the work item no longer publishable.
    pub publish_skipped: AtomicU64,

    // === Attempts ===
    /// Calls made to a platform publisher.
    pub publish_attempts: AtomicU64,
    /// Retries scheduled by the backoff controller.
    pub retries: AtomicU64,
    /// Attempts delayed by the rate limiter.
    pub rate_limit_waits: AtomicU64,
    /// Rate limiter decisions taken while the store was unavailable.
    pub rate_limit_fail_open: AtomicU64,

    // === Credentials ===
    /// Successful credential refreshes.
    pub token_refreshes: AtomicU64,
    /// Refreshes that ended with the account needing manual reauthorization.
    pub token_refresh_failures: AtomicU64,

    /// Total time spent inside publish attempts, in microseconds.
    pub publish_time_us_total: AtomicU64,
}

impl PipelineMetrics {
    /// Create a new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            jobs_scheduled: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            jobs_claimed: AtomicU64::new(0),
            jobs_stalled: AtomicU64::new(0),

            publish_succeeded: AtomicU64::new(0),
            publish_failed: AtomicU64::new(0),
            publish_skipped: AtomicU64::new(0),

            publish_attempts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            rate_limit_waits: AtomicU64::new(0),
            rate_limit_fail_open: AtomicU64::new(0),

            token_refreshes: AtomicU64::new(0),
            token_refresh_failures: AtomicU64::new(0),

            publish_time_us_total: AtomicU64::new(0),
        }
    }

    /// Increment a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one publish attempt and how long it took.
    pub fn record_publish_attempt(&self, duration: Duration) {
        self.publish_attempts.fetch_add(1, Ordering::Relaxed);
        self.publish_time_us_total
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a credential refresh result.
    pub fn record_refresh(&self, success: bool) {
        if success {
            self.token_refreshes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.token_refresh_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get a snapshot of current metrics.
    #[must_use]
    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            jobs_scheduled: self.jobs_scheduled.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            jobs_claimed: self.jobs_claimed.load(Ordering::Relaxed),
            jobs_stalled: self.jobs_stalled.load(Ordering::Relaxed),
            publish_succeeded: self.publish_succeeded.load(Ordering::Relaxed),
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
            publish_skipped: self.publish_skipped.load(Ordering::Relaxed),
            publish_attempts: self.publish_attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rate_limit_waits: self.rate_limit_waits.load(Ordering::Relaxed),
            rate_limit_fail_open: self.rate_limit_fail_open.load(Ordering::Relaxed),
            token_refreshes: self.token_refreshes.load(Ordering::Relaxed),
            token_refresh_failures: self.token_refresh_failures.load(Ordering::Relaxed),
            publish_avg_time_us: self.average_publish_time_us(),
        }
    }

    fn average_publish_time_us(&self) -> u64 {
        let total = self.publish_time_us_total.load(Ordering::Relaxed);
        let count = self.publish_attempts.load(Ordering::Relaxed);
        if count > 0 { total / count } else { 0 }
    }

    /// Export metrics in Prometheus text format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        let counters = [
            ("cadence_jobs_scheduled", "Schedules accepted", snapshot.jobs_scheduled),
            ("cadence_jobs_cancelled", "Pending schedules removed", snapshot.jobs_cancelled),
            ("cadence_jobs_claimed", "Jobs claimed by workers", snapshot.jobs_claimed),
            ("cadence_jobs_stalled", "Claims reaped as stalled", snapshot.jobs_stalled),
            ("cadence_publish_succeeded", "Work items published", snapshot.publish_succeeded),
            ("cadence_publish_failed", "Work items failed", snapshot.publish_failed),
            ("cadence_publish_skipped", "Claims skipped as unpublishable", snapshot.publish_skipped),
            ("cadence_publish_attempts", "Platform publish calls", snapshot.publish_attempts),
            ("cadence_retries", "Retries after retryable failures", snapshot.retries),
            ("cadence_rate_limit_waits", "Attempts delayed by the rate limiter", snapshot.rate_limit_waits),
            ("cadence_rate_limit_fail_open", "Rate limit checks allowed during store outage", snapshot.rate_limit_fail_open),
            ("cadence_token_refreshes", "Successful credential refreshes", snapshot.token_refreshes),
            ("cadence_token_refresh_failures", "Failed credential refreshes", snapshot.token_refresh_failures),
        ];

        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name} {value}");
        }

        let _ = writeln!(output, "# HELP cadence_publish_avg_time_us Average publish attempt time");
        let _ = writeln!(output, "# TYPE cadence_publish_avg_time_us gauge");
        let _ = writeln!(output, "cadence_publish_avg_time_us {}", snapshot.publish_avg_time_us);

        output
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetricsSnapshot {
    pub jobs_scheduled: u64,
    pub jobs_cancelled: u64,
    pub jobs_claimed: u64,
    pub jobs_stalled: u64,
    pub publish_succeeded: u64,
    pub publish_failed: u64,
    pub publish_skipped: u64,
    pub publish_attempts: u64,
    pub retries: u64,
    pub rate_limit_waits: u64,
    pub rate_limit_fail_open: u64,
    pub token_refreshes: u64,
    pub token_refresh_failures: u64,
    pub publish_avg_time_us: u64,
}

/// Timer guard for measuring operation duration.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
