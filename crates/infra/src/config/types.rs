//! Service configuration model
//!
//! Every section has defaults, so a config file only needs to name what it
//! changes. Durations are integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use stack_common::duration_millis;
use stack_common::error::{CommonError, CommonResult};
use stack_common::resilience::{
    BreakerRegistry, CircuitBreakerSettings, RateLimiterConfig, RetryPolicy,
};

use crate::jobs::{JobBackoff, QueueSettings, RecurringJob, WorkerConfig};
use crate::logging::LogSettings;

/// Storage behind the job queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
}

stack_common::impl_label_conversions!(BackendKind {
    Memory => "memory",
    Redis => "redis",
});

/// Defaults for every circuit breaker the service creates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub max_trial_requests: u32,
    /// Cyclic reset of Closed-state counts (zero disables)
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    /// Time spent Open before trial calls are admitted
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Trip once consecutive failures exceed this; `None` keeps the
    /// failure-ratio default
    pub consecutive_failures: Option<u32>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_trial_requests: 3,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
            consecutive_failures: None,
        }
    }
}

impl BreakerConfig {
    /// Settings for the breaker guarding `name`
    pub fn settings(&self, name: &str) -> CircuitBreakerSettings {
        let settings = CircuitBreakerSettings::new(name)
            .max_trial_requests(self.max_trial_requests)
            .interval(self.interval)
            .timeout(self.timeout);
        match self.consecutive_failures {
            Some(threshold) => settings.trip_after_consecutive_failures(threshold),
            None => settings,
        }
    }

    /// Registry creating breakers from these defaults
    pub fn registry(&self) -> BreakerRegistry {
        let config = *self;
        BreakerRegistry::new(move |name| config.settings(name))
    }
}

/// Job queue section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: BackendKind,
    /// Required when `backend = "redis"`
    pub redis_url: Option<String>,
    pub default_max_retries: u32,
    pub backoff: JobBackoff,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let settings = QueueSettings::default();
        Self {
            backend: BackendKind::Memory,
            redis_url: None,
            default_max_retries: settings.default_max_retries,
            backoff: settings.backoff,
        }
    }
}

impl QueueConfig {
    pub const fn settings(&self) -> QueueSettings {
        QueueSettings { default_max_retries: self.default_max_retries, backoff: self.backoff }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimiterConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub log: LogSettings,
    pub recurring: Vec<RecurringJob>,
}

impl StackConfig {
    /// Check every section against its component's bounds
    ///
    /// # Errors
    /// Returns `CommonError::Config` naming the first offending field.
    pub fn validate(&self) -> CommonResult<()> {
        self.retry.validate()?;
        self.rate_limit.validate()?;
        self.worker.validate()?;

        if self.breaker.max_trial_requests == 0 {
            return Err(CommonError::config_field(
                "breaker.max_trial_requests",
                "must be at least 1",
            ));
        }
        if self.queue.default_max_retries == 0 {
            return Err(CommonError::config_field(
                "queue.default_max_retries",
                "must be at least 1",
            ));
        }
        if self.queue.backend == BackendKind::Redis
            && self.queue.redis_url.as_deref().map_or(true, |url| url.trim().is_empty())
        {
            return Err(CommonError::config_field(
                "queue.redis_url",
                "required when the queue backend is redis",
            ));
        }
        for job in &self.recurring {
            if job.name.trim().is_empty() || job.template.job_type.trim().is_empty() {
                return Err(CommonError::config_field(
                    "recurring",
                    "every recurring job needs a name and a template type",
                ));
            }
        }
        Ok(())
    }
}
