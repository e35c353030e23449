//! Worker pool that drains the job queue
//!
//! `start()` spawns `workers` poll loops plus one sweep loop that promotes
//! due scheduled jobs. Join handles are tracked, cancellation is explicit, and
//! every handler run is bounded by `job_timeout`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stack_infra::jobs::{HandlerError, Job, JobQueue, WorkerConfig, WorkerPool};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = Arc::new(JobQueue::in_memory());
//! let mut pool = WorkerPool::new(queue, WorkerConfig::default())?;
//! pool.register("provision", |job: Job, _cancel: CancellationToken| async move {
//!     tracing::info!(job_id = %job.id, "provisioning");
//!     Ok::<(), HandlerError>(())
//! });
//!
//! pool.start().await?;
//! // ... application runs ...
//! pool.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use stack_common::duration_millis;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::error::{JobQueueResult, SchedulerError, SchedulerResult};
use super::queue::{JobQueue, RetryOutcome};
use super::types::{Job, Priority, NO_HANDLER_FOUND};

/// Error type returned by job handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes jobs of one type
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job; any error sends it through the queue's retry path
    ///
    /// `cancel` fires when the pool is stopping.
    async fn handle(&self, job: &Job, cancel: CancellationToken) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, job: &Job, cancel: CancellationToken) -> Result<(), HandlerError> {
        (self)(job.clone(), cancel).await
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent poll loops
    pub workers: usize,
    /// Delay between dequeue attempts of one loop
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Delay between scheduled-set sweeps
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,
    /// Upper bound for a single handler run
    #[serde(with = "duration_millis")]
    pub job_timeout: Duration,
    /// Join timeout when stopping
    #[serde(with = "duration_millis")]
    pub join_timeout: Duration,
    /// Lane scan order
    pub priorities: Vec<Priority>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(10),
            job_timeout: Duration::from_secs(300),
            join_timeout: Duration::from_secs(5),
            priorities: Priority::ALL_DESC.to_vec(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.workers == 0 {
            return Err(SchedulerError::InvalidConfiguration(
                "workers must be at least 1".to_string(),
            ));
        }
        for (field, value) in [
            ("poll_interval", self.poll_interval),
            ("sweep_interval", self.sweep_interval),
            ("job_timeout", self.job_timeout),
        ] {
            if value.is_zero() {
                return Err(SchedulerError::InvalidConfiguration(format!(
                    "{field} must be greater than zero"
                )));
            }
        }
        if self.priorities.is_empty() {
            return Err(SchedulerError::InvalidConfiguration(
                "priorities must name at least one lane".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of processing one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { job_id: String },
    Retried { job_id: String, retries: u32 },
    DeadLettered { job_id: String, reason: String },
}

/// Shared running counters
#[derive(Debug, Default)]
pub struct WorkerCounters {
    active_workers: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time copy of [`WorkerCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub active_workers: usize,
    pub processed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl WorkerCounters {
    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            active_workers: self.active_workers.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Counts a poll loop as active until it is dropped, including by abort
struct ActiveWorker(Arc<WorkerCounters>);

impl ActiveWorker {
    fn enter(counters: Arc<WorkerCounters>) -> Self {
        counters.active_workers.fetch_add(1, Ordering::Relaxed);
        Self(counters)
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.active_workers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// State shared by every loop of one pool
struct Shared {
    queue: Arc<JobQueue>,
    handlers: DashMap<String, Arc<dyn JobHandler>>,
    counters: Arc<WorkerCounters>,
    priorities: Vec<Priority>,
    job_timeout: Duration,
}

impl Shared {
    async fn process_next(&self, cancel: &CancellationToken) -> JobQueueResult<Option<JobOutcome>> {
        let Some(job) = self.queue.dequeue(&self.priorities).await? else {
            return Ok(None);
        };
        self.handle_job(job, cancel).await.map(Some)
    }

    async fn handle_job(&self, job: Job, cancel: &CancellationToken) -> JobQueueResult<JobOutcome> {
        let job_id = job.id.clone();
        let handler = self.handlers.get(&job.job_type).map(|entry| Arc::clone(entry.value()));
        let Some(handler) = handler else {
            error!(job_id = %job_id, job_type = %job.job_type, "No handler for job type");
            self.queue.move_to_dead_letter(job, NO_HANDLER_FOUND).await?;
            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            return Ok(JobOutcome::DeadLettered { job_id, reason: NO_HANDLER_FOUND.to_string() });
        };

        info!(
            job_id = %job_id,
            job_type = %job.job_type,
            priority = job.priority.as_u8(),
            retries = job.retries,
            "Processing job"
        );
        let started = Instant::now();

        let failure = match tokio::time::timeout(
            self.job_timeout,
            handler.handle(&job, cancel.child_token()),
        )
        .await
        {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                Some(format!("job timed out after {}s", self.job_timeout.as_secs()))
            }
        };
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let Some(failure) = failure else {
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            info!(job_id = %job_id, elapsed_ms, "Job completed");
            return Ok(JobOutcome::Completed { job_id });
        };

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        error!(job_id = %job_id, error = %failure, "Job failed");
        match self.queue.retry(job).await? {
            RetryOutcome::Rescheduled { retries, .. } => {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                Ok(JobOutcome::Retried { job_id, retries })
            }
            RetryOutcome::DeadLettered { .. } => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                Ok(JobOutcome::DeadLettered {
                    job_id,
                    reason: super::types::MAX_RETRIES_EXCEEDED.to_string(),
                })
            }
        }
    }
}

/// Worker pool with explicit lifecycle management.
pub struct WorkerPool {
    shared: Arc<Shared>,
    config: WorkerConfig,
    cancellation: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("handlers", &self.handler_types())
            .field("running", &self.is_running())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool over `queue`; no loops run until [`Self::start`]
    pub fn new(queue: Arc<JobQueue>, config: WorkerConfig) -> SchedulerResult<Self> {
        config.validate()?;
        let shared = Shared {
            queue,
            handlers: DashMap::new(),
            counters: Arc::new(WorkerCounters::default()),
            priorities: config.priorities.clone(),
            job_timeout: config.job_timeout,
        };
        Ok(Self {
            shared: Arc::new(shared),
            config,
            cancellation: CancellationToken::new(),
            handles: Vec::new(),
        })
    }

    /// Register (or replace) the handler for `job_type`
    ///
    /// Takes effect immediately, including on a running pool.
    pub fn register<H>(&self, job_type: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        let job_type = job_type.into();
        debug!(job_type = %job_type, "Registered job handler");
        self.shared.handlers.insert(job_type, Arc::new(handler));
    }

    /// Registered job types, sorted
    pub fn handler_types(&self) -> Vec<String> {
        let mut types: Vec<String> =
            self.shared.handlers.iter().map(|entry| entry.key().clone()).collect();
        types.sort();
        types
    }

    pub fn counters(&self) -> Arc<WorkerCounters> {
        Arc::clone(&self.shared.counters)
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.counters.snapshot()
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.shared.queue
    }

    /// Dequeue and handle a single job on the caller's task
    pub async fn process_next(&self) -> JobQueueResult<Option<JobOutcome>> {
        self.shared.process_next(&self.cancellation).await
    }

    /// Returns true while the loops are running.
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Start the poll loops and the sweep loop.
    #[instrument(skip(self), fields(workers = self.config.workers))]
    pub async fn start(&mut self) -> SchedulerResult<()> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        self.cancellation = CancellationToken::new();

        for worker_id in 0..self.config.workers {
            let shared = Arc::clone(&self.shared);
            let cancel = self.cancellation.clone();
            let poll_interval = self.config.poll_interval;
            self.handles.push(tokio::spawn(async move {
                Self::poll_loop(worker_id, shared, poll_interval, cancel).await;
            }));
        }

        let queue = Arc::clone(&self.shared.queue);
        let cancel = self.cancellation.clone();
        let sweep_interval = self.config.sweep_interval;
        self.handles.push(tokio::spawn(async move {
            Self::sweep_loop(queue, sweep_interval, cancel).await;
        }));

        info!(scheduler = "worker_pool", event = "start", "Worker pool started");
        Ok(())
    }

    /// Stop every loop and wait for them to finish.
    ///
    /// Loops still running after `join_timeout` are aborted, and their
    /// in-flight jobs are lost. The pool is stopped either way.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> SchedulerResult<()> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }

        self.cancellation.cancel();

        let join_timeout = self.config.join_timeout;
        let joined = tokio::time::timeout(
            join_timeout,
            futures::future::join_all(self.handles.iter_mut()),
        )
        .await;

        let result = match joined {
            Ok(results) => match results.into_iter().find_map(Result::err) {
                Some(err) => {
                    warn!(error = %err, "Worker task panicked");
                    Err(SchedulerError::TaskJoinFailed(err.to_string()))
                }
                None => Ok(()),
            },
            Err(_) => {
                let stragglers: Vec<JoinHandle<()>> =
                    self.handles.drain(..).filter(|handle| !handle.is_finished()).collect();
                warn!(
                    tasks = stragglers.len(),
                    timeout_ms = u64::try_from(join_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Worker tasks did not stop in time; aborting"
                );
                for handle in &stragglers {
                    handle.abort();
                }
                for handle in stragglers {
                    // Only the cancellation error is expected here.
                    let _ = handle.await;
                }
                Err(SchedulerError::timeout(join_timeout))
            }
        };

        self.handles.clear();
        self.cancellation = CancellationToken::new();

        if result.is_ok() {
            info!(scheduler = "worker_pool", event = "stop", "Worker pool stopped");
        }
        result
    }

    async fn poll_loop(
        worker_id: usize,
        shared: Arc<Shared>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) {
        let _active = ActiveWorker::enter(Arc::clone(&shared.counters));
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(worker = worker_id, "Worker loop cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    match shared.process_next(&cancel).await {
                        Ok(Some(outcome)) => debug!(worker = worker_id, ?outcome, "Job handled"),
                        Ok(None) => {}
                        Err(err) => {
                            error!(worker = worker_id, error = %err, "Failed to process job");
                        }
                    }
                }
            }
        }
    }

    async fn sweep_loop(queue: Arc<JobQueue>, sweep_interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Sweep loop cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = queue.promote_scheduled().await {
                        error!(error = %err, "Failed to promote scheduled jobs");
                    }
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.is_running() {
            warn!(
                scheduler = "worker_pool",
                event = "drop_cancel",
                "WorkerPool dropped while running; cancelling tasks"
            );
            self.cancellation.cancel();
        }
    }
}
