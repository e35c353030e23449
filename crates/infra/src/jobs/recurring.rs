//! Cron-driven producer of recurring jobs
//!
//! Each registration pairs a name with a six-field cron expression (seconds
//! first) and a job template. On every tick a copy of the template is
//! enqueued with a fresh id, so the work itself runs on the worker pool and
//! gets its retries and dead-lettering there.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::error::{SchedulerError, SchedulerResult};
use super::queue::JobQueue;
use super::types::Job;

/// A named schedule and the job it produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringJob {
    pub name: String,
    /// Cron expression with a leading seconds field, e.g. `0 */5 * * * *`
    pub cron: String,
    pub template: Job,
}

impl RecurringJob {
    pub fn new(name: impl Into<String>, cron: impl Into<String>, template: Job) -> Self {
        Self { name: name.into(), cron: cron.into(), template }
    }
}

struct Registration {
    job: RecurringJob,
    guid: Option<Uuid>,
}

/// Recurring job producer with explicit lifecycle management.
pub struct RecurringScheduler {
    queue: Arc<JobQueue>,
    scheduler: Option<JobScheduler>,
    registrations: HashMap<String, Registration>,
    start_timeout: Duration,
    stop_timeout: Duration,
    enqueue_timeout: Duration,
}

impl std::fmt::Debug for RecurringScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecurringScheduler")
            .field("names", &self.names())
            .field("running", &self.is_running())
            .finish()
    }
}

impl RecurringScheduler {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self {
            queue,
            scheduler: None,
            registrations: HashMap::new(),
            start_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            enqueue_timeout: Duration::from_secs(30),
        }
    }

    /// Register `job`, replacing any registration with the same name
    ///
    /// The cron expression is validated immediately. On a running scheduler
    /// the schedule is live as soon as this returns.
    #[instrument(skip_all, fields(name = %job.name, cron = %job.cron))]
    pub async fn add(&mut self, job: RecurringJob) -> SchedulerResult<()> {
        let definition = self.cron_job(&job)?;

        if self.registrations.contains_key(&job.name) {
            self.remove(&job.name).await?;
        }

        let guid = match &self.scheduler {
            Some(scheduler) => Some(
                scheduler
                    .add(definition)
                    .await
                    .map_err(|e| SchedulerError::JobRegistrationFailed(e.to_string()))?,
            ),
            None => None,
        };

        debug!(job_id = ?guid, "Registered recurring job");
        self.registrations.insert(job.name.clone(), Registration { job, guid });
        Ok(())
    }

    /// Drop the registration named `name`; returns whether it existed
    pub async fn remove(&mut self, name: &str) -> SchedulerResult<bool> {
        let Some(registration) = self.registrations.remove(name) else {
            return Ok(false);
        };
        if let (Some(scheduler), Some(guid)) = (&self.scheduler, registration.guid) {
            scheduler
                .remove(&guid)
                .await
                .map_err(|e| SchedulerError::JobRegistrationFailed(e.to_string()))?;
        }
        debug!(name, "Removed recurring job");
        Ok(true)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registrations.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns true when a scheduler instance is active.
    pub fn is_running(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Start ticking every registered schedule.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> SchedulerResult<()> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let scheduler =
            JobScheduler::new().await.map_err(|e| SchedulerError::CreationFailed(e.to_string()))?;

        let mut guids = Vec::with_capacity(self.registrations.len());
        for (name, registration) in &self.registrations {
            let definition = self.cron_job(&registration.job)?;
            let guid = scheduler
                .add(definition)
                .await
                .map_err(|e| SchedulerError::JobRegistrationFailed(e.to_string()))?;
            guids.push((name.clone(), guid));
        }

        tokio::time::timeout(self.start_timeout, scheduler.start())
            .await
            .map_err(|_| SchedulerError::timeout(self.start_timeout))?
            .map_err(|e| SchedulerError::StartFailed(e.to_string()))?;

        for (name, guid) in guids {
            if let Some(registration) = self.registrations.get_mut(&name) {
                registration.guid = Some(guid);
            }
        }
        self.scheduler = Some(scheduler);

        info!(
            scheduler = "recurring",
            event = "start",
            jobs = self.registrations.len(),
            "Recurring scheduler started"
        );
        Ok(())
    }

    /// Stop ticking; registrations are kept for the next start.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> SchedulerResult<()> {
        let Some(mut scheduler) = self.scheduler.take() else {
            return Err(SchedulerError::NotRunning);
        };

        tokio::time::timeout(self.stop_timeout, async move { scheduler.shutdown().await })
            .await
            .map_err(|_| SchedulerError::timeout(self.stop_timeout))?
            .map_err(|e| SchedulerError::StopFailed(e.to_string()))?;

        for registration in self.registrations.values_mut() {
            registration.guid = None;
        }

        info!(scheduler = "recurring", event = "stop", "Recurring scheduler stopped");
        Ok(())
    }

    fn cron_job(&self, job: &RecurringJob) -> SchedulerResult<CronJob> {
        let queue = Arc::clone(&self.queue);
        let template = job.template.clone();
        let name = job.name.clone();
        let enqueue_timeout = self.enqueue_timeout;

        CronJob::new_async(job.cron.as_str(), move |_id, _lock| {
            let queue = Arc::clone(&queue);
            let template = template.clone();
            let name = name.clone();

            Box::pin(async move {
                let job = Job { id: String::new(), retries: 0, created_at: None, ..template };
                match tokio::time::timeout(enqueue_timeout, queue.enqueue(job)).await {
                    Ok(Ok(job)) => {
                        info!(
                            scheduler = "recurring",
                            name = %name,
                            job_id = %job.id,
                            "Recurring job enqueued"
                        );
                    }
                    Ok(Err(err)) => {
                        error!(
                            scheduler = "recurring",
                            name = %name,
                            error = %err,
                            "Failed to enqueue recurring job"
                        );
                    }
                    Err(_) => {
                        warn!(
                            scheduler = "recurring",
                            name = %name,
                            timeout_secs = enqueue_timeout.as_secs(),
                            "Recurring enqueue timed out"
                        );
                    }
                }
            })
        })
        .map_err(|e| {
            SchedulerError::JobRegistrationFailed(format!("invalid cron '{}': {e}", job.cron))
        })
    }
}

impl Drop for RecurringScheduler {
    fn drop(&mut self) {
        if self.is_running() {
            warn!(
                scheduler = "recurring",
                event = "drop_running",
                "RecurringScheduler dropped while running"
            );
        }
    }
}
