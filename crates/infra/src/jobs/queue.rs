//! Priority job queue with delayed retries and a dead-letter lane
//!
//! Storage layout (see [`QueueBackend`]):
//!
//! | Key | Structure | Contents |
//! |-----|-----------|----------|
//! | `queue:low`, `queue:normal`, `queue:high`, `queue:critical` | FIFO list | ready jobs |
//! | `queue:scheduled` | sorted set scored by Unix seconds | deferred jobs |
//! | `queue:dead_letter` | FIFO list | jobs that need manual attention |
//!
//! The queue has no timer of its own. Deferred jobs only become visible when a
//! driver (the worker pool's sweep loop, or a test) calls
//! [`JobQueue::promote_scheduled`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stack_common::resilience::{Clock, SystemClock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backend::QueueBackend;
use super::error::{JobQueueError, JobQueueResult};
use super::memory::InMemoryBackend;
use super::types::{Job, JobBackoff, Priority, FAILURE_REASON_KEY, MAX_RETRIES_EXCEEDED};

/// Sorted set of deferred jobs
pub const SCHEDULED_KEY: &str = "queue:scheduled";

/// List of dead-lettered jobs
pub const DEAD_LETTER_KEY: &str = "queue:dead_letter";

/// Queue-wide defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Applied when a job arrives with `max_retries == 0`
    pub default_max_retries: u32,
    /// Delay before a failed job is retried
    pub backoff: JobBackoff,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { default_max_retries: 3, backoff: JobBackoff::default() }
    }
}

/// What [`JobQueue::retry`] did with a failed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Re-enqueued, visible again at `visible_at`
    Rescheduled { retries: u32, visible_at: DateTime<Utc> },
    /// Retry budget spent, moved to the dead-letter lane
    DeadLettered { retries: u32 },
}

/// Point-in-time queue sizes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Backend name (`memory`, `redis`)
    pub backend: String,
    /// Ready jobs per priority label
    pub lanes: BTreeMap<String, u64>,
    pub scheduled: u64,
    pub dead_letter: u64,
    /// Undecodable entries dropped by this process
    pub malformed_skipped: u64,
}

/// Job queue over a [`QueueBackend`]
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
    malformed: Arc<AtomicU64>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("backend", &self.backend.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            settings: QueueSettings::default(),
            clock: Arc::new(SystemClock),
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue over a fresh [`InMemoryBackend`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    #[must_use]
    pub fn with_settings(mut self, settings: QueueSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub const fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.clock.system_time())
    }

    /// Store a job, filling in unset defaults
    ///
    /// Jobs scheduled in the future go to the scheduled set; everything else
    /// is appended to its priority lane. Returns the job as stored.
    #[instrument(skip_all, fields(job_type = %job.job_type, priority = %job.priority))]
    pub async fn enqueue(&self, mut job: Job) -> JobQueueResult<Job> {
        if job.job_type.trim().is_empty() {
            return Err(JobQueueError::InvalidJob("job type must not be empty".to_string()));
        }

        let now = self.now();
        if job.id.is_empty() {
            job.id = Uuid::now_v7().to_string();
        }
        if job.created_at.is_none() {
            job.created_at = Some(now);
        }
        if job.max_retries == 0 {
            job.max_retries = self.settings.default_max_retries;
        }

        let data = serde_json::to_string(&job)?;
        match job.scheduled_at {
            Some(at) if at > now => {
                self.backend.schedule(SCHEDULED_KEY, data, at.timestamp()).await?;
                debug!(job_id = %job.id, scheduled_at = %at, "Job scheduled");
            }
            _ => {
                self.backend.push(job.priority.queue_key(), data).await?;
                debug!(job_id = %job.id, "Job enqueued");
            }
        }
        Ok(job)
    }

    /// Pop the head of the first non-empty lane, scanning `priorities` in order
    ///
    /// Undecodable entries are logged and dropped; the scan continues with the
    /// next entry of the same lane.
    pub async fn dequeue(&self, priorities: &[Priority]) -> JobQueueResult<Option<Job>> {
        for priority in priorities {
            let lane = priority.queue_key();
            while let Some(raw) = self.backend.pop(lane).await? {
                match serde_json::from_str::<Job>(&raw) {
                    Ok(job) => {
                        debug!(job_id = %job.id, lane, "Job dequeued");
                        return Ok(Some(job));
                    }
                    Err(e) => {
                        self.malformed.fetch_add(1, Ordering::Relaxed);
                        error!(lane, error = %e, "Skipping malformed job entry");
                    }
                }
            }
        }
        Ok(None)
    }

    /// Record a failure: re-enqueue with a delay, or dead-letter once
    /// `retries` reaches `max_retries`
    #[instrument(skip_all, fields(job_id = %job.id, job_type = %job.job_type))]
    pub async fn retry(&self, mut job: Job) -> JobQueueResult<RetryOutcome> {
        job.retries = job.retries.saturating_add(1);
        if job.retries >= job.max_retries {
            let retries = job.retries;
            self.move_to_dead_letter(job, MAX_RETRIES_EXCEEDED).await?;
            return Ok(RetryOutcome::DeadLettered { retries });
        }

        let delay = self.settings.backoff.delay(job.retries);
        let visible_at = self.now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        job.scheduled_at = Some(visible_at);

        let retries = job.retries;
        info!(
            retries,
            max_retries = job.max_retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Retrying job"
        );
        self.enqueue(job).await?;
        Ok(RetryOutcome::Rescheduled { retries, visible_at })
    }

    /// Annotate the payload with `reason` and append to the dead-letter lane
    ///
    /// Nothing reads the lane automatically.
    #[instrument(skip_all, fields(job_id = %job.id, job_type = %job.job_type))]
    pub async fn move_to_dead_letter(&self, mut job: Job, reason: &str) -> JobQueueResult<()> {
        job.payload.insert(FAILURE_REASON_KEY.to_string(), reason.into());
        let data = serde_json::to_string(&job)?;
        self.backend.push(DEAD_LETTER_KEY, data).await?;
        warn!(retries = job.retries, reason, "Job moved to dead letter");
        Ok(())
    }

    /// Move every due scheduled job back onto its priority lane
    ///
    /// Entries are claimed before they are re-enqueued, so concurrent sweeps
    /// never promote the same job twice. If a backend call fails mid-batch,
    /// the failed entry and every entry not yet handled go back to the
    /// scheduled set before the error is returned. Returns the number
    /// promoted.
    pub async fn promote_scheduled(&self) -> JobQueueResult<usize> {
        let now = self.clock.unix_seconds();
        let claimed = self.backend.claim_due(SCHEDULED_KEY, now).await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        let mut promoted = 0;
        let mut pending = claimed.into_iter();
        while let Some(raw) = pending.next() {
            match self.promote_entry(&raw).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(err) => {
                    let remaining = std::iter::once(raw).chain(pending);
                    let returned = self.return_to_scheduled(remaining, now).await;
                    error!(
                        error = %err,
                        promoted,
                        returned,
                        "Promotion interrupted, unhandled entries returned to the scheduled set"
                    );
                    return Err(err);
                }
            }
        }

        if promoted > 0 {
            info!(promoted, "Promoted scheduled jobs");
        }
        Ok(promoted)
    }

    /// Push one claimed entry to its lane, or to the dead letter when it
    /// cannot be decoded. Returns `true` when a job was promoted.
    async fn promote_entry(&self, raw: &str) -> JobQueueResult<bool> {
        let mut job = match serde_json::from_str::<Job>(raw) {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "Malformed scheduled entry moved to dead letter");
                self.backend.push(DEAD_LETTER_KEY, raw.to_string()).await?;
                self.malformed.fetch_add(1, Ordering::Relaxed);
                return Ok(false);
            }
        };

        job.scheduled_at = None;
        let data = serde_json::to_string(&job)?;
        self.backend.push(job.priority.queue_key(), data).await?;
        debug!(job_id = %job.id, "Scheduled job promoted");
        Ok(true)
    }

    async fn return_to_scheduled(
        &self,
        entries: impl Iterator<Item = String> + Send,
        score: i64,
    ) -> usize {
        let mut returned = 0;
        for raw in entries {
            match self.backend.schedule(SCHEDULED_KEY, raw, score).await {
                Ok(()) => returned += 1,
                Err(e) => error!(error = %e, "Failed to return entry to the scheduled set"),
            }
        }
        returned
    }

    pub async fn queue_size(&self, priority: Priority) -> JobQueueResult<u64> {
        Ok(self.backend.list_len(priority.queue_key()).await?)
    }

    pub async fn dead_letter_size(&self) -> JobQueueResult<u64> {
        Ok(self.backend.list_len(DEAD_LETTER_KEY).await?)
    }

    pub async fn scheduled_size(&self) -> JobQueueResult<u64> {
        Ok(self.backend.set_len(SCHEDULED_KEY).await?)
    }

    /// Oldest dead-lettered jobs, for manual inspection
    pub async fn peek_dead_letter(&self, limit: usize) -> JobQueueResult<Vec<Job>> {
        let raw = self.backend.list_head(DEAD_LETTER_KEY, limit).await?;
        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str::<Job>(entry) {
                Ok(job) => Some(job),
                Err(e) => {
                    debug!(error = %e, "Undecodable dead-letter entry");
                    None
                }
            })
            .collect())
    }

    pub async fn snapshot(&self) -> JobQueueResult<QueueSnapshot> {
        let mut lanes = BTreeMap::new();
        for priority in Priority::ALL_DESC {
            lanes.insert(priority.to_string(), self.queue_size(priority).await?);
        }
        Ok(QueueSnapshot {
            backend: self.backend.name().to_string(),
            lanes,
            scheduled: self.scheduled_size().await?,
            dead_letter: self.dead_letter_size().await?,
            malformed_skipped: self.malformed.load(Ordering::Relaxed),
        })
    }
}
