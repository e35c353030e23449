//! Background job processing
//!
//! - [`queue`]: priority lanes, deferred retries, dead letter
//! - [`backend`]: the list/sorted-set port, with [`memory`] and (feature
//!   `redis`) Redis implementations
//! - [`worker`]: handler registry and the polling worker pool
//! - [`recurring`]: cron schedules that enqueue templated jobs
//!
//! Delivery is at-most-once: a job popped by a worker that then crashes is
//! lost.

pub mod backend;
pub mod error;
pub mod memory;
pub mod queue;
pub mod recurring;
pub mod types;
pub mod worker;

#[cfg(feature = "redis")]
pub mod redis;

pub use backend::QueueBackend;
pub use error::{JobQueueError, JobQueueResult, SchedulerError, SchedulerResult};
pub use memory::InMemoryBackend;
pub use queue::{
    JobQueue, QueueSettings, QueueSnapshot, RetryOutcome, DEAD_LETTER_KEY, SCHEDULED_KEY,
};
pub use recurring::{RecurringJob, RecurringScheduler};
pub use types::{
    Job, JobBackoff, Payload, Priority, FAILURE_REASON_KEY, MAX_RETRIES_EXCEEDED,
    NO_HANDLER_FOUND,
};
pub use worker::{
    HandlerError, JobHandler, JobOutcome, WorkerConfig, WorkerCounters, WorkerPool, WorkerStats,
};

#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;
