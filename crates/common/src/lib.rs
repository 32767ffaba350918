//! Common utilities and shared types for cadence.
//!
//! This crate provides foundational components used across all cadence crates:
//!
//! - **Configuration**: Pipeline settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **ID Generation**: ULID-based unique identifiers via [`IdGenerator`]
//! - **Metrics**: Pipeline counters via [`PipelineMetrics`]
//! - **Telemetry**: Tracing subscriber setup via [`init_tracing`]
//!
//! # Example
//!
//! ```no_run
//! use cadence_common::{AppResult, Config, IdGenerator, init_tracing};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config.logging);
//!     let id = IdGenerator::new().generate();
//!     println!("Generated ID: {}", id);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod metrics;
pub mod telemetry;

pub use config::{
    Config, LoggingConfig, MediaConfig, PlatformLimit, RedisConfig, RetrySettings,
    SchedulerSettings,
};
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
pub use metrics::{PipelineMetrics, PipelineMetricsSnapshot, Timer};
pub use telemetry::init_tracing;
