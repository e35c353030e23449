//! Resilience hot-path benchmarks
//!
//! Covers breaker admission (closed and open), the full trip/recover cycle,
//! retry executor outcomes, and backoff calculation per jitter mode.
//!
//! Run with: `cargo bench --bench resilience_bench -p stack-common
//! --features runtime`

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use stack_common::error::{is_retryable_default, UpstreamError};
use stack_common::resilience::{
    BreakerError, CircuitBreaker, CircuitBreakerSettings, Jitter, MockClock, RetryExecutor,
    RetryPolicy,
};
use tokio::runtime::Builder as RuntimeBuilder;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Circuit Breaker Benchmarks
// ============================================================================

fn bench_circuit_breaker_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker_admission");

    group.bench_function("closed_success", |b| {
        let breaker = CircuitBreaker::new(CircuitBreakerSettings::new("bench"));
        b.iter(|| {
            let result: Result<(), BreakerError<UpstreamError>> = breaker.call(|| Ok(()));
            let _ = black_box(result);
        });
    });

    group.bench_function("open_short_circuit", |b| {
        let breaker = CircuitBreaker::new(
            CircuitBreakerSettings::new("bench")
                .trip_after_consecutive_failures(0)
                .timeout(Duration::from_secs(3600)),
        );
        let _ = breaker.call(|| Err::<(), _>(UpstreamError::timeout("initial failure")));

        b.iter(|| {
            let result: Result<(), BreakerError<UpstreamError>> = breaker.call(|| Ok(()));
            black_box(result.is_err());
        });
    });

    group.finish();
}

fn bench_circuit_breaker_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker_cycle");

    group.bench_function("trip_half_open_recover", |b| {
        b.iter(|| {
            let clock = MockClock::new();
            let settings = CircuitBreakerSettings::new("bench")
                .trip_after_consecutive_failures(2)
                .max_trial_requests(2)
                .timeout(Duration::from_millis(10));
            let breaker = CircuitBreaker::with_clock(settings, clock.clone());

            for _ in 0..3 {
                let _ = breaker.call(|| Err::<(), _>("trip"));
            }
            clock.advance(Duration::from_millis(10));
            let _ = breaker.call(|| Ok::<_, &str>(()));
            let _ = breaker.call(|| Ok::<_, &str>(()));

            black_box(breaker.state());
        });
    });

    group.finish();
}

// ============================================================================
// Retry Benchmarks
// ============================================================================

fn zero_delay_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .base_delay(Duration::ZERO)
        .max_delay(Duration::ZERO)
        .jitter(Jitter::None)
        .build()
        .expect("zero-delay policy is valid")
}

fn bench_retry_executor_outcomes(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_executor_outcomes");
    let runtime = RuntimeBuilder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime should build for benchmarks");
    let ctx = CancellationToken::new();

    group.bench_function("immediate_success", |b| {
        let executor = RetryExecutor::new(zero_delay_policy(3)).expect("valid policy");
        b.to_async(&runtime).iter(|| async {
            let result = executor
                .execute(&ctx, || async { Ok::<_, UpstreamError>(()) }, is_retryable_default)
                .await;
            let _ = black_box(result);
        });
    });

    group.bench_function("transient_then_success", |b| {
        let executor = RetryExecutor::new(zero_delay_policy(5)).expect("valid policy");
        b.to_async(&runtime).iter(|| async {
            let mut remaining = 3u32;
            let result = executor
                .execute(
                    &ctx,
                    move || {
                        let fail_now = remaining > 0;
                        remaining = remaining.saturating_sub(1);
                        async move {
                            if fail_now {
                                Err(UpstreamError::transient("connection reset"))
                            } else {
                                Ok(())
                            }
                        }
                    },
                    is_retryable_default,
                )
                .await;
            let _ = black_box(result);
        });
    });

    group.finish();
}

// ============================================================================
// Backoff Benchmarks
// ============================================================================

fn bench_backoff_jitter(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff_jitter");

    for jitter in [Jitter::None, Jitter::Full, Jitter::Equal, Jitter::Decorrelated] {
        let policy = RetryPolicy { jitter, max_attempts: 10, ..RetryPolicy::standard() };
        group.bench_with_input(BenchmarkId::from_parameter(jitter), &policy, |b, policy| {
            let mut rng = StdRng::seed_from_u64(42);
            b.iter(|| {
                let mut previous = None;
                for attempt in 1..=policy.max_attempts {
                    let delay = policy.delay_with_rng(attempt, previous, &mut rng);
                    previous = Some(black_box(delay));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    resilience,
    bench_circuit_breaker_admission,
    bench_circuit_breaker_cycle,
    bench_retry_executor_outcomes,
    bench_backoff_jitter
);
criterion_main!(resilience);
