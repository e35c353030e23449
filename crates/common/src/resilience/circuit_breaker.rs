//! Three-state circuit breaker protecting calls to an unreliable upstream
//!
//! State machine (initial state `Closed`):
//!
//! ```text
//!            ready_to_trip(counts)               timeout elapsed
//!  Closed ─────────────────────────▶ Open ─────────────────────────▶ HalfOpen
//!    ▲                                ▲                                 │
//!    │                                └──────── any failure ────────────┤
//!    └──────────── max_trial_requests consecutive successes ────────────┘
//! ```
//!
//! Open → HalfOpen is evaluated lazily on the next admission check; no timer
//! task runs. Every transition starts a new generation and clears the counts,
//! so outcomes of calls admitted under an earlier generation are discarded.
//!
//! While Closed, a non-zero `interval` clears the counts cyclically so old
//! failures age out of the trip decision.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use crate::error::{ErrorClassification, ErrorSeverity};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow through and outcomes are counted
    Closed,
    /// Calls are rejected without reaching the upstream
    Open,
    /// A limited number of trial calls test the upstream
    HalfOpen,
}

crate::impl_label_conversions!(CircuitState {
    Closed => "Closed",
    Open => "Open",
    HalfOpen => "HalfOpen",
});

/// Request and outcome counters for the current generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = Self::default();
    }

    /// `total_failures / requests`, zero before the first request
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            f64::from(self.total_failures) / f64::from(self.requests)
        }
    }
}

/// Trip predicate evaluated after every failure while Closed
pub type ReadyToTrip = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;

/// Observer of state transitions, called with `(name, from, to)`
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Trip once consecutive failures exceed `threshold`
pub fn consecutive_failures_above(threshold: u32) -> ReadyToTrip {
    Arc::new(move |counts: &Counts| counts.consecutive_failures > threshold)
}

/// Trip once at least `min_requests` were seen and the failure ratio reaches `ratio`
pub fn failure_ratio(min_requests: u32, ratio: f64) -> ReadyToTrip {
    Arc::new(move |counts: &Counts| {
        counts.requests >= min_requests && counts.failure_ratio() >= ratio
    })
}

/// Default trip predicate: 3+ requests with a 60% failure ratio
pub fn default_ready_to_trip() -> ReadyToTrip {
    failure_ratio(3, 0.6)
}

/// Construction settings for a [`CircuitBreaker`]
#[derive(Clone)]
pub struct CircuitBreakerSettings {
    /// Upstream name, reported in errors, logs and the state hook
    pub name: String,
    /// Calls admitted in HalfOpen, and consecutive successes needed to close
    pub max_trial_requests: u32,
    /// Cyclic count reset period while Closed, zero disables
    pub interval: Duration,
    /// Time spent Open before a trial is allowed
    pub timeout: Duration,
    pub ready_to_trip: ReadyToTrip,
    pub on_state_change: Option<StateChangeHook>,
}

impl fmt::Debug for CircuitBreakerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerSettings")
            .field("name", &self.name)
            .field("max_trial_requests", &self.max_trial_requests)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerSettings {
    pub const DEFAULT_MAX_TRIAL_REQUESTS: u32 = 3;
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Settings with defaults: 3 trial requests, 10s interval, 60s timeout,
    /// ratio-based trip
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_trial_requests: Self::DEFAULT_MAX_TRIAL_REQUESTS,
            interval: Self::DEFAULT_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
            ready_to_trip: default_ready_to_trip(),
            on_state_change: None,
        }
    }

    #[must_use]
    pub fn max_trial_requests(mut self, max: u32) -> Self {
        self.max_trial_requests = max;
        self
    }

    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn ready_to_trip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.ready_to_trip = Arc::new(predicate);
        self
    }

    #[must_use]
    pub fn trip_after_consecutive_failures(mut self, threshold: u32) -> Self {
        self.ready_to_trip = consecutive_failures_above(threshold);
        self
    }

    #[must_use]
    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(hook));
        self
    }
}

/// Failure of a breaker-protected call
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Rejected because the breaker is Open
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    /// Rejected because the HalfOpen trial window is full
    #[error("circuit breaker '{name}' rejected call: too many trial requests")]
    TooManyTrialRequests { name: String },

    /// The protected operation ran and failed
    #[error(transparent)]
    Upstream(E),
}

impl<E> BreakerError<E> {
    /// True for both rejection variants
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::Open { .. } | Self::TooManyTrialRequests { .. })
    }

    pub const fn upstream(&self) -> Option<&E> {
        match self {
            Self::Upstream(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_upstream(self) -> Option<E> {
        match self {
            Self::Upstream(err) => Some(err),
            _ => None,
        }
    }
}

impl<E: ErrorClassification> ErrorClassification for BreakerError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream(err) => err.is_retryable(),
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Upstream(err) => err.severity(),
            _ => ErrorSeverity::Warning,
        }
    }

    fn is_critical(&self) -> bool {
        self.upstream().is_some_and(ErrorClassification::is_critical)
    }

    fn retry_after(&self) -> Option<Duration> {
        self.upstream().and_then(ErrorClassification::retry_after)
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub counts: Counts,
}

type Transition = (CircuitState, CircuitState);

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// Circuit breaker shared by every call to one upstream
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: String,
    max_trial_requests: u32,
    interval: Duration,
    timeout: Duration,
    ready_to_trip: ReadyToTrip,
    on_state_change: Option<StateChangeHook>,
    clock: C,
    inner: Mutex<Inner>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.inner.lock().state)
            .field("max_trial_requests", &self.max_trial_requests)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker<SystemClock> {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self::with_clock(settings, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Build a breaker on an explicit clock
    ///
    /// A zero `max_trial_requests` is raised to 1 and a zero `timeout` falls
    /// back to the 60s default.
    pub fn with_clock(settings: CircuitBreakerSettings, clock: C) -> Self {
        let now = clock.now();
        let max_trial_requests = settings.max_trial_requests.max(1);
        let timeout = if settings.timeout.is_zero() {
            CircuitBreakerSettings::DEFAULT_TIMEOUT
        } else {
            settings.timeout
        };
        let expiry = (!settings.interval.is_zero()).then(|| now + settings.interval);

        Self {
            name: settings.name,
            max_trial_requests,
            interval: settings.interval,
            timeout,
            ready_to_trip: settings.ready_to_trip,
            on_state_change: settings.on_state_change,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying any pending Open → HalfOpen transition
    pub fn state(&self) -> CircuitState {
        let mut transitions = Vec::new();
        let state = {
            let mut inner = self.inner.lock();
            self.current_state(&mut inner, self.clock.now(), &mut transitions).0
        };
        self.emit(&transitions);
        state
    }

    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        BreakerSnapshot { name: self.name.clone(), state, counts: self.counts() }
    }

    /// Force the breaker back to Closed with fresh counts
    pub fn reset(&self) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            if inner.state == CircuitState::Closed {
                self.new_generation(&mut inner, now);
            } else {
                self.set_state(&mut inner, CircuitState::Closed, now, &mut transitions);
            }
        }
        self.emit(&transitions);
        info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    /// Run `operation` if admitted; every error counts as a failure
    #[instrument(skip_all, fields(breaker = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_filtered(operation, |_| true).await
    }

    /// Run `operation` if admitted; only errors for which `is_failure`
    /// returns true count against the upstream
    ///
    /// Errors that do not count are still returned unchanged.
    pub async fn execute_filtered<F, Fut, T, E, P>(
        &self,
        operation: F,
        is_failure: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut admission = self.admit::<E>()?;
        let result = operation().await;
        admission.complete(result.as_ref().map_or_else(|err| !is_failure(err), |_| true));
        result.map_err(BreakerError::Upstream)
    }

    /// Synchronous form of [`execute`](Self::execute)
    pub fn call<F, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut admission = self.admit::<E>()?;
        let result = operation();
        admission.complete(result.is_ok());
        result.map_err(BreakerError::Upstream)
    }

    fn admit<E>(&self) -> Result<Admission<'_, C>, BreakerError<E>> {
        let generation = self.before_request::<E>()?;
        Ok(Admission { breaker: self, generation, completed: false })
    }

    fn before_request<E>(&self) -> Result<u64, BreakerError<E>> {
        let mut transitions = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock();
            let (state, generation) =
                self.current_state(&mut inner, self.clock.now(), &mut transitions);

            match state {
                CircuitState::Open => Err(BreakerError::Open { name: self.name.clone() }),
                CircuitState::HalfOpen if inner.counts.requests >= self.max_trial_requests => {
                    Err(BreakerError::TooManyTrialRequests { name: self.name.clone() })
                }
                _ => {
                    inner.counts.on_request();
                    Ok(generation)
                }
            }
        };
        self.emit(&transitions);

        if let Err(err) = &outcome {
            debug!(
                breaker = %self.name,
                error = %DisplayRejection(err),
                "Circuit breaker rejected call"
            );
        }
        outcome
    }

    fn after_request(&self, before: u64, success: bool) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            let (state, generation) = self.current_state(&mut inner, now, &mut transitions);
            if generation != before {
                debug!(breaker = %self.name, "Discarding outcome from a previous generation");
            } else if success {
                self.on_success(&mut inner, state, now, &mut transitions);
            } else {
                self.on_failure(&mut inner, state, now, &mut transitions);
            }
        }
        self.emit(&transitions);
    }

    fn on_success(
        &self,
        inner: &mut Inner,
        state: CircuitState,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        match state {
            CircuitState::Closed => inner.counts.on_success(),
            CircuitState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.max_trial_requests {
                    self.set_state(inner, CircuitState::Closed, now, transitions);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(
        &self,
        inner: &mut Inner,
        state: CircuitState,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        match state {
            CircuitState::Closed => {
                inner.counts.on_failure();
                if (self.ready_to_trip)(&inner.counts) {
                    self.set_state(inner, CircuitState::Open, now, transitions);
                }
            }
            CircuitState::HalfOpen => {
                self.set_state(inner, CircuitState::Open, now, transitions);
            }
            CircuitState::Open => {}
        }
    }

    fn current_state(
        &self,
        inner: &mut Inner,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) -> (CircuitState, u64) {
        match inner.state {
            CircuitState::Closed => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.new_generation(inner, now);
                }
            }
            CircuitState::Open => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.set_state(inner, CircuitState::HalfOpen, now, transitions);
                }
            }
            CircuitState::HalfOpen => {}
        }
        (inner.state, inner.generation)
    }

    fn set_state(
        &self,
        inner: &mut Inner,
        state: CircuitState,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        if inner.state == state {
            return;
        }
        let from = inner.state;
        inner.state = state;
        self.new_generation(inner, now);
        transitions.push((from, state));
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts.clear();
        inner.expiry = match inner.state {
            CircuitState::Closed => (!self.interval.is_zero()).then(|| now + self.interval),
            CircuitState::Open => Some(now + self.timeout),
            CircuitState::HalfOpen => None,
        };
    }

    /// Log and publish transitions outside the state lock
    fn emit(&self, transitions: &[Transition]) {
        for &(from, to) in transitions {
            match to {
                CircuitState::Open => {
                    warn!(breaker = %self.name, from = %from, to = %to, "Circuit breaker opened");
                }
                _ => {
                    info!(
                        breaker = %self.name,
                        from = %from,
                        to = %to,
                        "Circuit breaker state changed"
                    );
                }
            }
            if let Some(hook) = &self.on_state_change {
                hook(&self.name, from, to);
            }
        }
    }
}

/// Outcome slot for an admitted call
///
/// A call dropped before reporting (e.g. its future was cancelled) is recorded
/// as a failure so a HalfOpen trial slot is never leaked.
struct Admission<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    generation: u64,
    completed: bool,
}

impl<C: Clock> Admission<'_, C> {
    fn complete(&mut self, success: bool) {
        self.completed = true;
        self.breaker.after_request(self.generation, success);
    }
}

impl<C: Clock> Drop for Admission<'_, C> {
    fn drop(&mut self) {
        if !self.completed {
            self.breaker.after_request(self.generation, false);
        }
    }
}

struct DisplayRejection<'a, E>(&'a BreakerError<E>);

impl<E> fmt::Display for DisplayRejection<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            BreakerError::Open { .. } => f.write_str("open"),
            BreakerError::TooManyTrialRequests { .. } => f.write_str("too many trial requests"),
            BreakerError::Upstream(_) => f.write_str("upstream"),
        }
    }
}

type SettingsTemplate = Arc<dyn Fn(&str) -> CircuitBreakerSettings + Send + Sync>;

/// One breaker per named upstream, created on first use
#[derive(Clone)]
pub struct BreakerRegistry {
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    template: SettingsTemplate,
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry").field("breakers", &self.breakers.len()).finish()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(|name| CircuitBreakerSettings::new(name))
    }
}

impl BreakerRegistry {
    /// Registry whose breakers are built from `template(name)`
    pub fn new<F>(template: F) -> Self
    where
        F: Fn(&str) -> CircuitBreakerSettings + Send + Sync + 'static,
    {
        Self { breakers: Arc::new(DashMap::new()), template: Arc::new(template) }
    }

    /// Shared breaker for `name`, created from the template when missing
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(breaker = %name, "Registering circuit breaker");
            Arc::new(CircuitBreaker::new((self.template)(name)))
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Register a breaker built elsewhere, replacing any breaker of the same name
    pub fn insert(&self, breaker: Arc<CircuitBreaker>) {
        self.breakers.insert(breaker.name().to_string(), breaker);
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshots of every registered breaker, sorted by name
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|entry| Arc::clone(entry.value())).collect();
        let mut snapshots: Vec<BreakerSnapshot> =
            breakers.iter().map(|breaker| breaker.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
