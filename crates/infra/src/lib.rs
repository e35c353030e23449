//! # Stack Infrastructure
//!
//! Runtime pieces built on the `stack-common` resilience primitives.
//!
//! This crate contains:
//! - The priority job queue with its in-memory and Redis backends
//! - The worker pool and cron-driven recurring jobs
//! - Service configuration loading
//! - Tracing setup and the metrics snapshot
//!
//! ## Architecture
//! - Depends on `stack-common` for errors, clocks, breakers and limiters
//! - Contains all "impure" code (I/O, background tasks)

pub mod config;
pub mod jobs;
pub mod logging;
pub mod observability;

// Re-export commonly used items
pub use config::StackConfig;
pub use jobs::{
    InMemoryBackend, Job, JobHandler, JobQueue, JobQueueError, Priority, QueueBackend,
    RecurringScheduler, WorkerConfig, WorkerPool,
};
pub use observability::{MetricsSnapshot, SnapshotCollector};
