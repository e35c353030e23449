//! Shared resilience primitives for Stack Service integrations.
//!
//! Every outbound integration (custody, KYC, fiat rails, inference) is wrapped
//! in the same chain: circuit breaker admission, a rate-limiter token per
//! attempt, and a bounded retry loop driven by a backoff policy. This crate
//! holds those pieces plus the error taxonomy they classify against.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: error taxonomy, clock abstraction, backoff math, serde helpers
//! - `observability`: tracing instrumentation
//! - `runtime`: async executors (retry, circuit breaker, rate limiter, guarded
//!   calls)

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod resilience;
#[cfg(feature = "foundation")]
pub mod utils;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "foundation")]
pub use error::{
    is_retryable_default, CommonError, CommonResult, ErrorClassification, ErrorKind,
    ErrorSeverity, UpstreamError,
};
#[cfg(feature = "foundation")]
pub use resilience::{
    Backoff, BackoffStrategy, Clock, Jitter, MockClock, PolicyError, RetryPolicy,
    RetryPolicyBuilder, SystemClock,
};
#[cfg(feature = "runtime")]
pub use resilience::{
    BreakerError, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitBreakerSettings,
    CircuitState, Counts, GuardedClient, GuardedError, RateLimitError, RateLimiter,
    RateLimiterConfig, RateLimiterSnapshot, RetryError, RetryExecutor,
};
#[cfg(feature = "foundation")]
pub use utils::serde::{duration_millis, option_duration_millis};
