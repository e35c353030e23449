//! Bounded retry loop driven by a [`RetryPolicy`]
//!
//! The executor holds no shared mutable state: every `execute` call owns its
//! attempt counter and backoff history, so one executor can be shared across
//! tasks freely.
//!
//! Every non-success path returns a distinct [`RetryError`] variant:
//! - `NonRetryable`: the predicate refused the error, no further attempts
//! - `Exhausted`: `max_attempts` reached, wraps the last error
//! - `Cancelled`: the cancellation token fired before an attempt or during a
//!   backoff sleep

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::backoff::{Backoff, PolicyError, RetryPolicy};
use crate::error::{ErrorClassification, ErrorSeverity};

/// Failure of a retried operation
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The predicate classified the error as permanent
    #[error("non-retryable error on attempt {attempt}: {source}")]
    NonRetryable { attempt: u32, source: E },

    /// Every allowed attempt failed
    #[error("max retry attempts ({attempts}) exceeded: {source}")]
    Exhausted { attempts: u32, source: E },

    /// Cancellation interrupted the loop
    #[error("retry cancelled after {attempt} attempt(s)")]
    Cancelled { attempt: u32 },

    /// The policy failed validation
    #[error(transparent)]
    InvalidPolicy(#[from] PolicyError),
}

/// Result type for retried operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

impl<E> RetryError<E> {
    /// The last underlying error, when one exists
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::NonRetryable { source, .. } | Self::Exhausted { source, .. } => Some(source),
            Self::Cancelled { .. } | Self::InvalidPolicy(_) => None,
        }
    }

    /// Borrow the last underlying error
    pub const fn last_error(&self) -> Option<&E> {
        match self {
            Self::NonRetryable { source, .. } | Self::Exhausted { source, .. } => Some(source),
            Self::Cancelled { .. } | Self::InvalidPolicy(_) => None,
        }
    }

    /// Number of attempts that actually ran
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::NonRetryable { attempt, .. } | Self::Cancelled { attempt } => *attempt,
            Self::Exhausted { attempts, .. } => *attempts,
            Self::InvalidPolicy(_) => 0,
        }
    }

    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    pub const fn is_non_retryable(&self) -> bool {
        matches!(self, Self::NonRetryable { .. })
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl<E: ErrorClassification> ErrorClassification for RetryError<E> {
    fn is_retryable(&self) -> bool {
        // The retry budget is already spent at this layer.
        false
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::NonRetryable { source, .. } => source.severity(),
            Self::Exhausted { source, .. } => source.severity().max(ErrorSeverity::Error),
            Self::Cancelled { .. } => ErrorSeverity::Info,
            Self::InvalidPolicy(_) => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        self.last_error().is_some_and(ErrorClassification::is_critical)
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Report for a single failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    /// 1-based attempt number
    pub attempt: u32,
    /// Rendered error of the attempt
    pub error: Option<String>,
    /// Time spent inside the operation for this attempt
    pub elapsed: Duration,
    /// Delay before the next attempt, `None` when the loop stops
    pub next_delay: Option<Duration>,
}

type AttemptObserver = Arc<dyn Fn(&AttemptOutcome) + Send + Sync>;

/// Executes operations under a retry policy
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    observer: Option<AttemptObserver>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl RetryExecutor {
    /// Create an executor after validating `policy`
    pub fn new(policy: RetryPolicy) -> Result<Self, PolicyError> {
        policy.validate()?;
        Ok(Self { policy, observer: None })
    }

    /// Register a callback invoked after every failed attempt
    #[must_use]
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&AttemptOutcome) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, the predicate refuses an error,
    /// attempts run out, or `ctx` is cancelled
    #[instrument(skip_all, fields(max_attempts = self.policy.max_attempts))]
    pub async fn execute<F, Fut, T, E, P>(
        &self,
        ctx: &CancellationToken,
        operation: F,
        is_retryable: P,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        self.run(ctx, operation, is_retryable, |_| None).await
    }

    /// Like [`execute`](Self::execute), classifying errors through
    /// [`ErrorClassification`]
    ///
    /// `retry_after()` acts as a lower bound on the next delay (still capped
    /// at `max_delay`), which is how a server `Retry-After` reaches the
    /// backoff.
    #[instrument(skip_all, fields(max_attempts = self.policy.max_attempts))]
    pub async fn execute_classified<F, Fut, T, E>(
        &self,
        ctx: &CancellationToken,
        operation: F,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ErrorClassification + fmt::Display,
    {
        self.run(ctx, operation, E::is_retryable, E::retry_after).await
    }

    async fn run<F, Fut, T, E, P, H>(
        &self,
        ctx: &CancellationToken,
        mut operation: F,
        is_retryable: P,
        delay_hint: H,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        H: Fn(&E) -> Option<Duration>,
        E: fmt::Display,
    {
        let max_attempts = self.policy.max_attempts;
        let mut backoff = Backoff::new(self.policy.clone());
        let mut attempt = 0;

        loop {
            if ctx.is_cancelled() {
                debug!(attempt, "Retry loop cancelled before next attempt");
                return Err(RetryError::Cancelled { attempt });
            }

            attempt += 1;
            let started = Instant::now();
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };
            let elapsed = started.elapsed();

            if !is_retryable(&error) {
                self.notify(attempt, &error, elapsed, None);
                debug!(attempt, error = %error, "Operation failed with non-retryable error");
                return Err(RetryError::NonRetryable { attempt, source: error });
            }

            if attempt >= max_attempts {
                self.notify(attempt, &error, elapsed, None);
                warn!(attempts = attempt, error = %error, "Retry attempts exhausted");
                return Err(RetryError::Exhausted { attempts: attempt, source: error });
            }

            let mut delay = backoff.next_delay(attempt);
            if let Some(hint) = delay_hint(&error) {
                let hint = hint.min(self.policy.max_delay);
                if hint > delay {
                    delay = hint;
                    backoff.observe(delay);
                }
            }

            self.notify(attempt, &error, elapsed, Some(delay));
            warn!(
                attempt,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Attempt failed, retrying"
            );

            tokio::select! {
                biased;
                () = ctx.cancelled() => {
                    debug!(attempt, "Retry backoff interrupted by cancellation");
                    return Err(RetryError::Cancelled { attempt });
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn notify<E: fmt::Display>(
        &self,
        attempt: u32,
        error: &E,
        elapsed: Duration,
        next_delay: Option<Duration>,
    ) {
        if let Some(observer) = &self.observer {
            observer(&AttemptOutcome {
                attempt,
                error: Some(error.to_string()),
                elapsed,
                next_delay,
            });
        }
    }
}

/// Validate `policy` and run `operation` once through a fresh executor
pub async fn retry<F, Fut, T, E, P>(
    ctx: &CancellationToken,
    policy: RetryPolicy,
    operation: F,
    is_retryable: P,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    let executor = RetryExecutor::new(policy)?;
    executor.execute(ctx, operation, is_retryable).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::error::{is_retryable_default, UpstreamError};
    use crate::resilience::backoff::Jitter;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(100))
            .jitter(Jitter::None)
            .build()
            .unwrap()
    }

    // ========================================================================
    // Termination Tests
    // ========================================================================

    /// Validates `RetryExecutor::execute` behavior for the always failing
    /// retryable operation scenario.
    ///
    /// Assertions:
    /// - Confirms exactly `max_attempts` invocations occur.
    /// - Confirms the error is `Exhausted` and wraps the last failure.
    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_runs_exactly_max_attempts() {
        let executor = RetryExecutor::new(fast_policy(4)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = CancellationToken::new();

        let calls_clone = Arc::clone(&calls);
        let result: RetryResult<(), UpstreamError> = executor
            .execute(
                &ctx,
                || {
                    let n = calls_clone.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Err(UpstreamError::from_status(503, format!("down #{n}"))) }
                },
                is_retryable_default,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 4);
        assert_eq!(err.into_inner().unwrap().message, "down #4");
    }

    /// Validates `RetryExecutor::execute` behavior for the non-retryable
    /// short-circuit scenario.
    ///
    /// Assertions:
    /// - Confirms the operation runs once.
    /// - Confirms the error is `NonRetryable`, not `Exhausted`.
    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_immediately() {
        let executor = RetryExecutor::new(fast_policy(5)).unwrap();
        let calls = AtomicU32::new(0);
        let ctx = CancellationToken::new();

        let result: RetryResult<(), UpstreamError> = executor
            .execute(
                &ctx,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(UpstreamError::from_status(404, "no such wallet")) }
                },
                is_retryable_default,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = result.unwrap_err();
        assert!(err.is_non_retryable());
        assert!(err.to_string().starts_with("non-retryable error on attempt 1"));
    }

    /// Validates `RetryExecutor::execute` behavior for the eventual success
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms the value from the third attempt is returned.
    /// - Confirms the observer saw two failed attempts with delays.
    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let executor = RetryExecutor::new(fast_policy(3))
            .unwrap()
            .with_observer(move |outcome| seen_clone.lock().unwrap().push(outcome.clone()));
        let calls = AtomicU32::new(0);
        let ctx = CancellationToken::new();

        let value = executor
            .execute(
                &ctx,
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err(UpstreamError::transient("connection reset"))
                        } else {
                            Ok(n)
                        }
                    }
                },
                is_retryable_default,
            )
            .await
            .unwrap();

        assert_eq!(value, 3);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].attempt, 1);
        assert_eq!(seen[0].next_delay, Some(Duration::from_millis(10)));
        assert_eq!(seen[1].next_delay, Some(Duration::from_millis(20)));
    }

    // ========================================================================
    // Cancellation Tests
    // ========================================================================

    /// Validates `RetryExecutor::execute` behavior for the cancellation during
    /// backoff scenario.
    ///
    /// Assertions:
    /// - Confirms cancellation aborts the sleep and returns `Cancelled`.
    /// - Confirms no further attempts run after cancellation.
    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff_sleep() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .base_delay(Duration::from_secs(30))
            .max_delay(Duration::from_secs(60))
            .jitter(Jitter::None)
            .build()
            .unwrap();
        let executor = RetryExecutor::new(policy).unwrap();
        let ctx = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let calls_clone = Arc::clone(&calls);
        let result: RetryResult<(), UpstreamError> = executor
            .execute(
                &ctx,
                || {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    async { Err(UpstreamError::timeout("deadline exceeded")) }
                },
                is_retryable_default,
            )
            .await;

        let err = result.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Validates the pre-cancelled token scenario.
    ///
    /// Assertions:
    /// - Confirms the operation is never invoked.
    #[tokio::test]
    async fn test_cancelled_token_skips_first_attempt() {
        let executor = RetryExecutor::new(fast_policy(3)).unwrap();
        let ctx = CancellationToken::new();
        ctx.cancel();
        let calls = AtomicU32::new(0);

        let result: RetryResult<(), UpstreamError> = executor
            .execute(
                &ctx,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                is_retryable_default,
            )
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempt: 0 })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    // ========================================================================
    // Classified Execution
    // ========================================================================

    /// Validates `RetryExecutor::execute_classified` behavior for the
    /// server-suggested delay scenario.
    ///
    /// Assertions:
    /// - Confirms a `Retry-After` hint raises the next delay.
    /// - Confirms the hint is capped at `max_delay`.
    #[tokio::test(start_paused = true)]
    async fn test_classified_honours_retry_after_hint() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let executor = RetryExecutor::new(fast_policy(3))
            .unwrap()
            .with_observer(move |o| seen_clone.lock().unwrap().push(o.next_delay));
        let ctx = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: RetryResult<(), UpstreamError> = executor
            .execute_classified(&ctx, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    let hint = if n == 0 { 50 } else { 5_000 };
                    Err(UpstreamError::rate_limited(Some(Duration::from_millis(hint))))
                }
            })
            .await;

        assert!(result.unwrap_err().is_exhausted());
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![Some(Duration::from_millis(50)), Some(Duration::from_millis(100)), None]
        );
    }

    /// Validates `retry` behavior for the invalid policy scenario.
    ///
    /// Assertions:
    /// - Confirms validation failures surface as `InvalidPolicy`.
    #[tokio::test]
    async fn test_retry_rejects_invalid_policy() {
        let ctx = CancellationToken::new();
        let policy = RetryPolicy { max_attempts: 0, ..RetryPolicy::quick() };
        let result: RetryResult<(), UpstreamError> =
            retry(&ctx, policy, || async { Ok(()) }, is_retryable_default).await;
        assert!(matches!(result, Err(RetryError::InvalidPolicy(_))));
    }
}
