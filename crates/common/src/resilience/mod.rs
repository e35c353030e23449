//! Resilience patterns for outbound integrations
//!
//! - [`backoff`]: delay calculation (exponential, linear, constant; four
//!   jitter modes) and named retry presets
//! - [`retry`]: cancellable bounded retry loop
//! - [`circuit_breaker`]: three-state breaker with a named registry
//! - [`rate_limiter`]: token bucket with a background refill task
//! - [`guard`]: the three composed for a single upstream
//!
//! Backoff math and the clock live in the `foundation` tier; everything that
//! needs Tokio sits behind `runtime`.

pub mod backoff;
pub mod clock;

#[cfg(feature = "runtime")]
pub mod circuit_breaker;
#[cfg(feature = "runtime")]
pub mod guard;
#[cfg(feature = "runtime")]
pub mod rate_limiter;
#[cfg(feature = "runtime")]
pub mod retry;

pub use backoff::{Backoff, BackoffStrategy, Jitter, PolicyError, RetryPolicy, RetryPolicyBuilder};
pub use clock::{Clock, MockClock, SystemClock};

#[cfg(feature = "runtime")]
pub use circuit_breaker::{
    consecutive_failures_above, default_ready_to_trip, failure_ratio, BreakerError,
    BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitBreakerSettings, CircuitState,
    Counts, ReadyToTrip, StateChangeHook,
};
#[cfg(feature = "runtime")]
pub use guard::{GuardedClient, GuardedError};
#[cfg(feature = "runtime")]
pub use rate_limiter::{RateLimitError, RateLimiter, RateLimiterConfig, RateLimiterSnapshot};
#[cfg(feature = "runtime")]
pub use retry::{retry, AttemptOutcome, RetryError, RetryExecutor, RetryResult};
