//! Scheduled publish pipeline for cadence.
//!
//! This crate turns "publish this content at time T" into a reliable,
//! at-most-once execution:
//!
//! - **Store**: shared sorted-set state in Redis (or memory) with atomic operations
//! - **Scheduler**: delayed jobs, one pending schedule per work item
//! - **Pool**: bounded concurrent execution of claimed jobs
//! - **Rate limiting**: sliding windows per platform, account and operation
//! - **Retry**: exponential backoff with jitter
//! - **Credentials**: token refresh after authentication failures
//! - **Workers**: the publish routine and its explicit outcome

pub mod clock;
pub mod credentials;
pub mod jobs;
pub mod pipeline;
pub mod pool;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod workers;

pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use credentials::{CredentialRefresher, RefreshOutcome};
pub use jobs::{DEFAULT_PRIORITY, JobOutcome, JobState, ScheduleId, ScheduledJob};
pub use pipeline::{PipelineHandle, PublishPipeline};
pub use pool::{JobHandler, WorkerPool};
pub use rate_limit::{PlatformRateLimiter, RateLimitKey, RateLimitResult};
pub use retry::{Retrier, RetryPolicy, Retryable, with_retry};
pub use scheduler::{JobScheduler, ScheduleError};
pub use store::{MemoryStore, QueueCounts, RedisStore, SharedStore, StoreError, WindowDecision};
pub use workers::{Outcome, PublishWorker, WorkerContext};
