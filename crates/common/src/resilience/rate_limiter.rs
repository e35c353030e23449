//! Token-bucket rate limiter with a background refill task
//!
//! The pool starts full at `burst` tokens. One refill task per limiter adds a
//! single token every `60s / rate_per_minute`; a tick that finds the pool
//! full is dropped, so the pool never holds more than `burst` tokens.
//!
//! Tokens are Tokio semaphore permits that are forgotten on acquisition.
//! Only the refill task adds permits, which keeps the capacity check and the
//! add free of races.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{CommonError, ErrorClassification, ErrorSeverity};

/// Rate limiter failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("timed out after {waited:?} waiting for a rate limit token")]
    Timeout { waited: Duration },

    #[error("rate limit token wait cancelled")]
    Cancelled,

    #[error("Invalid rate limiter configuration: {0}")]
    InvalidConfiguration(String),

    #[error("rate limiter requires a running Tokio runtime")]
    NoRuntime,
}

impl ErrorClassification for RateLimitError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::Cancelled => ErrorSeverity::Info,
            Self::InvalidConfiguration(_) => ErrorSeverity::Error,
            Self::NoRuntime => ErrorSeverity::Critical,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::NoRuntime)
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl From<RateLimitError> for CommonError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Timeout { waited } => Self::timeout("rate_limiter.acquire", waited),
            RateLimitError::Cancelled => Self::task_cancelled("rate_limiter.acquire"),
            RateLimitError::InvalidConfiguration(message) => Self::config(message),
            RateLimitError::NoRuntime => {
                Self::internal("rate limiter requires a running Tokio runtime")
            }
        }
    }
}

/// Token bucket parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Sustained refill rate
    pub rate_per_minute: u32,
    /// Pool capacity and initial fill
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { rate_per_minute: 60, burst: 10 }
    }
}

impl RateLimiterConfig {
    pub const fn new(rate_per_minute: u32, burst: u32) -> Self {
        Self { rate_per_minute, burst }
    }

    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.rate_per_minute == 0 {
            return Err(RateLimitError::InvalidConfiguration(
                "rate_per_minute must be at least 1".to_string(),
            ));
        }
        if self.burst == 0 {
            return Err(RateLimitError::InvalidConfiguration(
                "burst must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Time between refill ticks
    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs(60) / self.rate_per_minute.max(1)
    }
}

/// Point-in-time view of a limiter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    pub name: String,
    pub tokens_available: u32,
    pub capacity: u32,
    pub rate_per_minute: u32,
}

/// Shared token bucket guarding one upstream
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    tokens: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl RateLimiter {
    /// Build a full pool and spawn its refill task on the current runtime
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Result<Self, RateLimitError> {
        config.validate()?;
        let handle = Handle::try_current().map_err(|_| RateLimitError::NoRuntime)?;

        let name = name.into();
        let burst = usize::try_from(config.burst)
            .unwrap_or(Semaphore::MAX_PERMITS)
            .min(Semaphore::MAX_PERMITS);
        let tokens = Arc::new(Semaphore::new(burst));
        let shutdown = CancellationToken::new();

        handle.spawn(refill_loop(
            name.clone(),
            Arc::clone(&tokens),
            burst,
            config.refill_interval(),
            shutdown.clone(),
        ));
        debug!(
            limiter = %name,
            rate_per_minute = config.rate_per_minute,
            burst = config.burst,
            "Rate limiter started"
        );

        Ok(Self { name, config, tokens, shutdown })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn config(&self) -> RateLimiterConfig {
        self.config
    }

    pub const fn capacity(&self) -> u32 {
        self.config.burst
    }

    pub fn refill_interval(&self) -> Duration {
        self.config.refill_interval()
    }

    pub fn tokens_available(&self) -> u32 {
        u32::try_from(self.tokens.available_permits()).unwrap_or(u32::MAX)
    }

    /// Take a token without waiting
    pub fn try_acquire(&self) -> bool {
        self.tokens.try_acquire().map(|permit| permit.forget()).is_ok()
    }

    /// Wait for a token, up to `timeout`, unless `ctx` is cancelled first
    #[instrument(skip_all, fields(limiter = %self.name))]
    pub async fn acquire(
        &self,
        ctx: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), RateLimitError> {
        let started = Instant::now();
        tokio::select! {
            biased;
            () = ctx.cancelled() => {
                debug!("Token wait cancelled");
                Err(RateLimitError::Cancelled)
            }
            permit = self.tokens.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(_) => Err(RateLimitError::Cancelled),
            },
            () = tokio::time::sleep(timeout) => {
                let waited = started.elapsed();
                debug!(
                    waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    "Token wait timed out"
                );
                Err(RateLimitError::Timeout { waited })
            }
        }
    }

    /// Stop the refill task; waiting callers resolve through their own
    /// timeout or cancellation
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            debug!(limiter = %self.name, "Rate limiter shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        RateLimiterSnapshot {
            name: self.name.clone(),
            tokens_available: self.tokens_available(),
            capacity: self.capacity(),
            rate_per_minute: self.config.rate_per_minute,
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn refill_loop(
    name: String,
    tokens: Arc<Semaphore>,
    burst: usize,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if tokens.available_permits() < burst {
                    tokens.add_permits(1);
                }
            }
        }
    }
    debug!(limiter = %name, "Rate limiter refill stopped");
}
