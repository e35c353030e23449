//! Guarded upstream calls: breaker admission, a token per attempt, retries
//!
//! Call order for every [`GuardedClient`] call:
//!
//! 1. Reject immediately when the breaker is Open.
//! 2. Per attempt, take one rate-limiter token (bounded by `token_timeout`).
//! 3. Run the operation through the breaker.
//! 4. Retry retryable upstream failures under the retry policy.
//!
//! Breaker rejections and token failures end the loop at once; only errors
//! returned by the operation itself are retried.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::backoff::{PolicyError, RetryPolicy};
use super::circuit_breaker::{BreakerError, CircuitBreaker, CircuitState};
use super::rate_limiter::{RateLimitError, RateLimiter};
use super::retry::{RetryError, RetryExecutor};
use crate::error::{ErrorClassification, ErrorSeverity, UpstreamError};

/// Failure of a guarded call
#[derive(Debug, Error)]
pub enum GuardedError<E> {
    /// The breaker rejected the call
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// No token could be taken for an attempt
    #[error(transparent)]
    RateLimit(RateLimitError),

    /// The retry loop ended without success
    #[error(transparent)]
    Retry(RetryError<E>),
}

impl<E> GuardedError<E> {
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::RateLimit(RateLimitError::Cancelled) | Self::Retry(RetryError::Cancelled { .. })
        )
    }

    /// Last upstream error, when the operation ran at all
    pub fn into_upstream(self) -> Option<E> {
        match self {
            Self::Retry(err) => err.into_inner(),
            Self::CircuitOpen { .. } | Self::RateLimit(_) => None,
        }
    }
}

impl<E: ErrorClassification> ErrorClassification for GuardedError<E> {
    fn is_retryable(&self) -> bool {
        false
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::CircuitOpen { .. } => ErrorSeverity::Warning,
            Self::RateLimit(err) => err.severity(),
            Self::Retry(err) => err.severity(),
        }
    }

    fn is_critical(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } => false,
            Self::RateLimit(err) => err.is_critical(),
            Self::Retry(err) => err.is_critical(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Outcome of one attempt inside the retry loop
#[derive(Debug)]
enum Attempt<E> {
    Rejected(String),
    Token(RateLimitError),
    Upstream(E),
}

impl<E: fmt::Display> fmt::Display for Attempt<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(name) => write!(f, "circuit breaker '{name}' rejected the attempt"),
            Self::Token(err) => write!(f, "{err}"),
            Self::Upstream(err) => write!(f, "{err}"),
        }
    }
}

impl<E: ErrorClassification> ErrorClassification for Attempt<E> {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream(err) if err.is_retryable())
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Upstream(err) => err.severity(),
            Self::Rejected(_) | Self::Token(_) => ErrorSeverity::Warning,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Upstream(err) if err.is_critical())
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Upstream(err) => err.retry_after(),
            Self::Rejected(_) | Self::Token(_) => None,
        }
    }
}

fn into_guarded<E>(err: RetryError<Attempt<E>>) -> GuardedError<E> {
    match err {
        RetryError::NonRetryable { attempt, source } => match source {
            Attempt::Upstream(source) => {
                GuardedError::Retry(RetryError::NonRetryable { attempt, source })
            }
            Attempt::Rejected(name) => GuardedError::CircuitOpen { name },
            Attempt::Token(err) => GuardedError::RateLimit(err),
        },
        RetryError::Exhausted { attempts, source } => match source {
            Attempt::Upstream(source) => {
                GuardedError::Retry(RetryError::Exhausted { attempts, source })
            }
            Attempt::Rejected(name) => GuardedError::CircuitOpen { name },
            Attempt::Token(err) => GuardedError::RateLimit(err),
        },
        RetryError::Cancelled { attempt } => GuardedError::Retry(RetryError::Cancelled { attempt }),
        RetryError::InvalidPolicy(err) => GuardedError::Retry(RetryError::InvalidPolicy(err)),
    }
}

/// Client-side composition of one breaker, one limiter and a retry policy
#[derive(Debug, Clone)]
pub struct GuardedClient {
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    token_timeout: Duration,
}

impl GuardedClient {
    pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
    ) -> Result<Self, PolicyError> {
        Ok(Self {
            breaker,
            limiter,
            retry: RetryExecutor::new(policy)?,
            token_timeout: Self::DEFAULT_TOKEN_TIMEOUT,
        })
    }

    /// Bound the wait for each attempt's token
    #[must_use]
    pub const fn with_token_timeout(mut self, timeout: Duration) -> Self {
        self.token_timeout = timeout;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Guarded call with caller-supplied classification
    ///
    /// `is_retryable` drives the retry loop; `is_failure` decides which
    /// errors count against the breaker.
    #[instrument(skip_all, fields(breaker = %self.breaker.name(), limiter = %self.limiter.name()))]
    pub async fn call<F, Fut, T, E, P, Q>(
        &self,
        ctx: &CancellationToken,
        operation: F,
        is_retryable: P,
        is_failure: Q,
    ) -> Result<T, GuardedError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        Q: Fn(&E) -> bool,
        E: fmt::Display,
    {
        if let Some(name) = self.open_breaker() {
            return Err(GuardedError::CircuitOpen { name });
        }
        let (operation, is_failure) = (&operation, &is_failure);
        self.retry
            .execute(
                ctx,
                || self.attempt(ctx, operation, is_failure),
                |attempt: &Attempt<E>| {
                    matches!(attempt, Attempt::Upstream(err) if is_retryable(err))
                },
            )
            .await
            .map_err(into_guarded)
    }

    /// Guarded call for [`UpstreamError`]-returning clients
    ///
    /// Uses the default retry classification, honours `retry_after`, and
    /// only counts failures whose kind trips a breaker.
    #[instrument(skip_all, fields(breaker = %self.breaker.name(), limiter = %self.limiter.name()))]
    pub async fn call_upstream<F, Fut, T>(
        &self,
        ctx: &CancellationToken,
        operation: F,
    ) -> Result<T, GuardedError<UpstreamError>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        if let Some(name) = self.open_breaker() {
            return Err(GuardedError::CircuitOpen { name });
        }
        let is_failure = |err: &UpstreamError| err.kind.trips_breaker();
        let (operation, is_failure) = (&operation, &is_failure);
        self.retry
            .execute_classified(ctx, || self.attempt(ctx, operation, is_failure))
            .await
            .map_err(into_guarded)
    }

    fn open_breaker(&self) -> Option<String> {
        if self.breaker.state() == CircuitState::Open {
            debug!(breaker = %self.breaker.name(), "Skipping guarded call, circuit open");
            return Some(self.breaker.name().to_string());
        }
        None
    }

    async fn attempt<F, Fut, T, E, Q>(
        &self,
        ctx: &CancellationToken,
        operation: &F,
        is_failure: &Q,
    ) -> Result<T, Attempt<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Q: Fn(&E) -> bool,
    {
        if let Err(err) = self.limiter.acquire(ctx, self.token_timeout).await {
            return Err(Attempt::Token(err));
        }
        self.breaker.execute_filtered(operation, is_failure).await.map_err(|err| match err {
            BreakerError::Upstream(err) => Attempt::Upstream(err),
            BreakerError::Open { name } | BreakerError::TooManyTrialRequests { name } => {
                Attempt::Rejected(name)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    /// Validates classification of a single guarded attempt.
    ///
    /// Assertions:
    /// - Upstream errors delegate retryability, criticality and retry hints.
    /// - Breaker rejections and token failures are never retried.
    #[test]
    fn test_attempt_classification() {
        let hinted = Attempt::Upstream(UpstreamError::rate_limited(Some(Duration::from_secs(7))));
        assert!(hinted.is_retryable());
        assert!(!hinted.is_critical());
        assert_eq!(hinted.retry_after(), Some(Duration::from_secs(7)));

        let internal = Attempt::Upstream(UpstreamError::new(ErrorKind::Internal, "bad state"));
        assert!(internal.is_critical());

        let rejected = Attempt::<UpstreamError>::Rejected("custody".into());
        assert!(!rejected.is_retryable());
        assert!(!rejected.is_critical());
        assert_eq!(rejected.retry_after(), None);

        let token = Attempt::<UpstreamError>::Token(RateLimitError::NoRuntime);
        assert!(!token.is_retryable());
        assert_eq!(token.severity(), ErrorSeverity::Warning);
    }

    /// Validates classification of a finished guarded call.
    ///
    /// Assertions:
    /// - A guarded error is never retryable and carries no retry hint.
    /// - Criticality follows the wrapped rate-limiter error.
    #[test]
    fn test_guarded_error_classification() {
        let open = GuardedError::<UpstreamError>::CircuitOpen { name: "kyc".into() };
        assert!(!open.is_retryable());
        assert!(!open.is_critical());
        assert_eq!(open.retry_after(), None);

        let no_runtime = GuardedError::<UpstreamError>::RateLimit(RateLimitError::NoRuntime);
        assert!(no_runtime.is_critical());
        assert_eq!(no_runtime.retry_after(), None);
    }
}
