//! Backoff calculation for retried operations
//!
//! A [`RetryPolicy`] turns a 1-based attempt number into a delay:
//!
//! | Strategy | Base delay for attempt `n` |
//! |----------|----------------------------|
//! | `Exponential` | `base * multiplier^(n-1)`, capped at `max_delay` |
//! | `Linear` | `base * n`, capped at `max_delay` |
//! | `Constant` | `base` |
//!
//! Jitter is applied after the cap:
//!
//! - `None`: the capped delay as-is
//! - `Full`: uniform in `[0, delay]`
//! - `Equal`: `delay/2 + uniform(0, delay/2)`
//! - `Decorrelated`: uniform in `[base, min(max_delay, previous * 3)]`, which
//!   needs the previous delay carried forward by a [`Backoff`]
//!
//! Attempt `0` always yields a zero delay.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CommonError;
use crate::utils::serde::duration_millis;

/// How the un-jittered delay grows with the attempt number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base * multiplier^(attempt-1)`
    Exponential,
    /// `base * attempt`
    Linear,
    /// `base` for every attempt
    Constant,
}

crate::impl_label_conversions!(BackoffStrategy {
    Exponential => "exponential",
    Linear => "linear",
    Constant => "constant",
});

/// Randomisation applied on top of the computed delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jitter {
    /// No randomisation
    None,
    /// Uniform in `[0, delay]`
    Full,
    /// `delay/2 + uniform(0, delay/2)`
    Equal,
    /// Uniform in `[base, min(max, previous * 3)]`
    Decorrelated,
}

crate::impl_label_conversions!(Jitter {
    None => "none",
    Full => "full",
    Equal => "equal",
    Decorrelated => "decorrelated",
});

/// Rejected policy configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// A field violates its documented bound
    #[error("Invalid retry policy field '{field}': {message}")]
    Invalid { field: &'static str, message: String },
}

impl From<PolicyError> for CommonError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Invalid { field, message } => CommonError::config_field(field, message),
        }
    }
}

/// Immutable retry configuration owned by whoever builds the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (>= 1)
    pub max_attempts: u32,
    /// Delay for the first retry and the decorrelated lower bound
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound applied before jitter
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Growth factor for the exponential strategy (>= 1.0)
    pub multiplier: f64,
    /// Delay growth strategy
    #[serde(default = "default_strategy")]
    pub strategy: BackoffStrategy,
    /// Jitter mode
    pub jitter: Jitter,
}

const fn default_strategy() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    /// General purpose preset: 3 attempts, 1s base, 30s cap, x2, full jitter
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            strategy: BackoffStrategy::Exponential,
            jitter: Jitter::Full,
        }
    }

    /// Short transient database faults (deadlocks, serialization failures)
    pub fn database_transient() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            ..Self::standard()
        }
    }

    /// Partner HTTP APIs
    pub fn external_api() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            ..Self::standard()
        }
    }

    /// Upstreams that answered 429; long waits, equal jitter keeps a floor
    pub fn rate_limit() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            jitter: Jitter::Equal,
            ..Self::standard()
        }
    }

    /// Calls that timed out; slower growth
    pub fn timeout() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            multiplier: 1.5,
            ..Self::standard()
        }
    }

    /// Interactive paths that cannot wait long
    pub fn quick() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 1.5,
            ..Self::standard()
        }
    }

    /// Background work that must eventually get through
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(120),
            jitter: Jitter::Decorrelated,
            ..Self::standard()
        }
    }

    /// Single attempt, never retried
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, jitter: Jitter::None, ..Self::standard() }
    }

    /// Look up a preset by name (`standard`/`default`, `database_transient`,
    /// `external_api`, `rate_limit`, `timeout`, `quick`, `aggressive`,
    /// `no_retry`)
    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "standard" | "default" => Some(Self::standard()),
            "database_transient" => Some(Self::database_transient()),
            "external_api" => Some(Self::external_api()),
            "rate_limit" => Some(Self::rate_limit()),
            "timeout" => Some(Self::timeout()),
            "quick" => Some(Self::quick()),
            "aggressive" => Some(Self::aggressive()),
            "no_retry" => Some(Self::no_retry()),
            _ => None,
        }
    }

    /// Start a builder from the standard preset
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Check the documented bounds
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::Invalid {
                field: "max_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(PolicyError::Invalid {
                field: "multiplier",
                message: format!("must be a finite value >= 1.0, got {}", self.multiplier),
            });
        }
        if self.base_delay > self.max_delay {
            return Err(PolicyError::Invalid {
                field: "base_delay",
                message: format!(
                    "{:?} exceeds max_delay {:?}",
                    self.base_delay, self.max_delay
                ),
            });
        }
        Ok(())
    }

    /// Un-jittered delay for `attempt`, capped at `max_delay`
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.strategy {
            BackoffStrategy::Constant => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt).min(self.max_delay),
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
                let capped = secs.min(self.max_delay.as_secs_f64());
                if capped.is_finite() && capped >= 0.0 {
                    Duration::from_secs_f64(capped)
                } else {
                    self.max_delay
                }
            }
        }
    }

    /// Jittered delay for `attempt` without history
    ///
    /// Decorrelated jitter treats `base_delay` as the previous delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, None, &mut rand::thread_rng())
    }

    /// Jittered delay for `attempt` given the previous delay
    pub fn delay_after(&self, attempt: u32, previous: Option<Duration>) -> Duration {
        self.delay_with_rng(attempt, previous, &mut rand::thread_rng())
    }

    /// Jittered delay using a caller-supplied random source
    pub fn delay_with_rng<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        previous: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = self.capped_delay(attempt);
        match self.jitter {
            Jitter::None => delay,
            Jitter::Full => uniform(rng, Duration::ZERO, delay),
            Jitter::Equal => {
                let half = delay / 2;
                half + uniform(rng, Duration::ZERO, delay - half)
            }
            Jitter::Decorrelated => {
                let previous = previous.filter(|p| !p.is_zero()).unwrap_or(self.base_delay);
                let upper = self.max_delay.min(previous.saturating_mul(3));
                if upper <= self.base_delay {
                    self.base_delay
                } else {
                    uniform(rng, self.base_delay, upper)
                }
            }
        }
    }
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, low: Duration, high: Duration) -> Duration {
    let low_nanos = u64::try_from(low.as_nanos()).unwrap_or(u64::MAX);
    let high_nanos = u64::try_from(high.as_nanos()).unwrap_or(u64::MAX);
    if high_nanos <= low_nanos {
        return low;
    }
    Duration::from_nanos(rng.gen_range(low_nanos..=high_nanos))
}

/// Stateful calculator that carries the previous delay between attempts
///
/// Required for decorrelated jitter; harmless for the other modes.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    previous: Option<Duration>,
}

impl Backoff {
    /// Create a calculator with no history
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy, previous: None }
    }

    /// Delay to wait after the failed `attempt`, remembering it for the next
    /// call
    pub fn next_delay(&mut self, attempt: u32) -> Duration {
        let delay = self.policy.delay_after(attempt, self.previous);
        if attempt > 0 {
            self.previous = Some(delay);
        }
        delay
    }

    /// Record a delay chosen outside the calculator (e.g. a server hint)
    pub fn observe(&mut self, delay: Duration) {
        self.previous = Some(delay);
    }

    /// Previously returned delay, if any
    pub const fn previous(&self) -> Option<Duration> {
        self.previous
    }

    /// Forget history
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Policy driving this calculator
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

/// Builder for [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: RetryPolicy::standard() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    pub fn strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.policy.strategy = strategy;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.policy.jitter = jitter;
        self
    }

    pub fn build(self) -> Result<RetryPolicy, PolicyError> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}
