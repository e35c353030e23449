//! Integration tests for the job queue and worker pool
//!
//! Drives the queue through a shared `MockClock` so scheduled visibility,
//! the retry boundary and dead-lettering are deterministic.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use stack_common::resilience::{Clock, MockClock};
use stack_infra::jobs::{
    HandlerError, InMemoryBackend, Job, JobOutcome, JobQueue, Payload, Priority, QueueSettings,
    RetryOutcome, WorkerConfig, WorkerPool, MAX_RETRIES_EXCEEDED, NO_HANDLER_FOUND,
};
use tokio_util::sync::CancellationToken;

const START_SECS: u64 = 1_700_000_000;

fn harness() -> (Arc<JobQueue>, MockClock) {
    let clock = MockClock::starting_at(UNIX_EPOCH + Duration::from_secs(START_SECS));
    let queue = JobQueue::new(Arc::new(InMemoryBackend::new()))
        .with_settings(QueueSettings::default())
        .with_clock(Arc::new(clock.clone()));
    (Arc::new(queue), clock)
}

fn now(clock: &MockClock) -> DateTime<Utc> {
    DateTime::<Utc>::from(clock.system_time())
}

async fn total_ready(queue: &JobQueue) -> u64 {
    let mut total = 0;
    for priority in Priority::ALL_DESC {
        total += queue.queue_size(priority).await.expect("lane size");
    }
    total
}

// ============================================================================
// Priority ordering
// ============================================================================

/// Validates lane order across priorities and FIFO order within a lane.
///
/// Assertions:
/// - Confirms Critical drains before High, High before Normal, Normal before Low.
/// - Confirms two jobs of one priority come out in enqueue order.
#[tokio::test]
async fn test_dequeue_prefers_higher_priority_then_fifo() {
    let (queue, _clock) = harness();

    let low = queue.enqueue(Job::new("report", Priority::Low, Payload::new())).await.expect("low");
    let normal_a =
        queue.enqueue(Job::new("notify", Priority::Normal, Payload::new())).await.expect("a");
    let normal_b =
        queue.enqueue(Job::new("notify", Priority::Normal, Payload::new())).await.expect("b");
    let critical =
        queue.enqueue(Job::new("provision", Priority::Critical, Payload::new())).await.expect("c");

    let order: Vec<String> = {
        let mut ids = Vec::new();
        while let Some(job) = queue.dequeue(&Priority::ALL_DESC).await.expect("dequeue") {
            ids.push(job.id);
        }
        ids
    };

    assert_eq!(order, vec![critical.id, normal_a.id, normal_b.id, low.id]);
}

/// Validates that `dequeue` only scans the lanes it is given.
#[tokio::test]
async fn test_dequeue_respects_priority_subset() {
    let (queue, _clock) = harness();
    queue.enqueue(Job::new("report", Priority::Low, Payload::new())).await.expect("enqueue");

    let none = queue.dequeue(&[Priority::Critical, Priority::High]).await.expect("dequeue");
    assert!(none.is_none());
    assert_eq!(queue.queue_size(Priority::Low).await.expect("size"), 1);
}

// ============================================================================
// Scheduled promotion
// ============================================================================

/// Validates deferred visibility of a job scheduled ten seconds ahead.
///
/// Assertions:
/// - Confirms the job sits in the scheduled set, not its lane.
/// - Confirms a sweep before the due time promotes nothing.
/// - Confirms a sweep after the due time moves it to its lane without `scheduled_at`.
#[tokio::test]
async fn test_scheduled_job_promoted_only_when_due() {
    let (queue, clock) = harness();

    let job = Job::new("notify", Priority::High, Payload::new())
        .scheduled_at(now(&clock) + chrono::Duration::seconds(10));
    let stored = queue.enqueue(job).await.expect("enqueue");

    assert_eq!(queue.queue_size(Priority::High).await.expect("size"), 0);
    assert_eq!(queue.scheduled_size().await.expect("scheduled"), 1);
    assert!(queue.dequeue(&Priority::ALL_DESC).await.expect("dequeue").is_none());

    clock.advance_secs(5);
    assert_eq!(queue.promote_scheduled().await.expect("early sweep"), 0);
    assert_eq!(queue.scheduled_size().await.expect("scheduled"), 1);

    clock.advance_secs(6);
    assert_eq!(queue.promote_scheduled().await.expect("sweep"), 1);
    assert_eq!(queue.scheduled_size().await.expect("scheduled"), 0);
    assert_eq!(queue.queue_size(Priority::High).await.expect("size"), 1);

    let promoted = queue.dequeue(&Priority::ALL_DESC).await.expect("dequeue").expect("job");
    assert_eq!(promoted.id, stored.id);
    assert!(promoted.scheduled_at.is_none());
}

/// Validates that a scheduled time already in the past skips the scheduled set.
#[tokio::test]
async fn test_past_schedule_enqueues_immediately() {
    let (queue, clock) = harness();

    let job = Job::new("notify", Priority::Normal, Payload::new())
        .scheduled_at(now(&clock) - chrono::Duration::seconds(30));
    queue.enqueue(job).await.expect("enqueue");

    assert_eq!(queue.scheduled_size().await.expect("scheduled"), 0);
    assert!(queue.dequeue(&Priority::ALL_DESC).await.expect("dequeue").is_some());
}

// ============================================================================
// Retry boundary
// ============================================================================

/// Validates the `max_retries = 3` boundary with quadratic backoff.
///
/// Assertions:
/// - Confirms the first two failures reschedule after 1s and 4s.
/// - Confirms the third failure dead-letters with the retries-exceeded reason.
#[tokio::test]
async fn test_retry_boundary_at_three() {
    let (queue, clock) = harness();
    queue
        .enqueue(Job::new("sync", Priority::Normal, Payload::new()).with_max_retries(3))
        .await
        .expect("enqueue");

    let job = queue.dequeue(&Priority::ALL_DESC).await.expect("dequeue").expect("job");
    let first = queue.retry(job).await.expect("first failure");
    assert_eq!(
        first,
        RetryOutcome::Rescheduled {
            retries: 1,
            visible_at: now(&clock) + chrono::Duration::seconds(1)
        }
    );

    clock.advance_secs(1);
    assert_eq!(queue.promote_scheduled().await.expect("sweep"), 1);
    let job = queue.dequeue(&Priority::ALL_DESC).await.expect("dequeue").expect("job");
    assert_eq!(job.retries, 1);
    let second = queue.retry(job).await.expect("second failure");
    assert_eq!(
        second,
        RetryOutcome::Rescheduled {
            retries: 2,
            visible_at: now(&clock) + chrono::Duration::seconds(4)
        }
    );

    clock.advance_secs(4);
    assert_eq!(queue.promote_scheduled().await.expect("sweep"), 1);
    let job = queue.dequeue(&Priority::ALL_DESC).await.expect("dequeue").expect("job");
    assert_eq!(job.retries, 2);
    assert!(job.is_last_attempt());
    let third = queue.retry(job).await.expect("third failure");
    assert_eq!(third, RetryOutcome::DeadLettered { retries: 3 });

    assert_eq!(queue.scheduled_size().await.expect("scheduled"), 0);
    let dead = queue.peek_dead_letter(10).await.expect("dead letter");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].failure_reason(), Some(MAX_RETRIES_EXCEEDED));
}

// ============================================================================
// End to end
// ============================================================================

/// Validates a Critical "provision" job with a two-retry budget failing every time.
///
/// Assertions:
/// - Confirms the first failure reschedules and the job comes back after promotion.
/// - Confirms the second failure dead-letters it with `retries = 2`.
/// - Confirms a third dequeue finds nothing.
/// - Confirms the job is in no lane and not in the scheduled set.
#[tokio::test]
async fn test_provision_job_exhausts_retries_into_dead_letter() {
    let (queue, clock) = harness();

    let stored = queue
        .enqueue(
            Job::new("provision", Priority::Critical, Payload::new())
                .with_payload_value("account_id", "acc-42")
                .with_max_retries(2),
        )
        .await
        .expect("enqueue");
    assert_eq!(stored.max_retries, 2);

    let first = queue.dequeue(&Priority::ALL_DESC).await.expect("dequeue").expect("first attempt");
    assert_eq!(first.id, stored.id);
    assert!(matches!(
        queue.retry(first).await.expect("retry"),
        RetryOutcome::Rescheduled { retries: 1, .. }
    ));
    assert!(queue.dequeue(&Priority::ALL_DESC).await.expect("dequeue").is_none());

    clock.advance_secs(2);
    queue.promote_scheduled().await.expect("sweep");

    let second =
        queue.dequeue(&Priority::ALL_DESC).await.expect("dequeue").expect("second attempt");
    assert_eq!(second.id, stored.id);
    assert_eq!(second.retries, 1);
    assert!(matches!(
        queue.retry(second).await.expect("retry"),
        RetryOutcome::DeadLettered { retries: 2 }
    ));

    clock.advance_secs(60);
    queue.promote_scheduled().await.expect("sweep");
    assert!(queue.dequeue(&Priority::ALL_DESC).await.expect("dequeue").is_none());

    let dead = queue.peek_dead_letter(10).await.expect("dead letter");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, stored.id);
    assert_eq!(dead[0].retries, 2);
    assert!(dead[0].failure_reason().is_some_and(|reason| !reason.is_empty()));
    assert_eq!(dead[0].payload["account_id"], "acc-42");

    assert_eq!(total_ready(&queue).await, 0);
    assert_eq!(queue.scheduled_size().await.expect("scheduled"), 0);
    assert_eq!(queue.dead_letter_size().await.expect("dead letter size"), 1);
}

/// Validates the same flow through the worker pool's handler path.
///
/// Assertions:
/// - Confirms the handler runs once per attempt.
/// - Confirms outcomes go Retried then DeadLettered.
/// - Confirms the counters record two failures and one dead letter.
#[tokio::test]
async fn test_worker_pool_dead_letters_failing_provision() {
    let (queue, clock) = harness();
    let pool = WorkerPool::new(Arc::clone(&queue), WorkerConfig::default()).expect("pool");

    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);
    pool.register("provision", move |_job: Job, _cancel: CancellationToken| {
        let seen = Arc::clone(&seen);
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Err::<(), HandlerError>("custody unavailable".into())
        }
    });

    let stored = queue
        .enqueue(Job::new("provision", Priority::Critical, Payload::new()).with_max_retries(2))
        .await
        .expect("enqueue");

    let outcome = pool.process_next().await.expect("process").expect("outcome");
    assert_eq!(outcome, JobOutcome::Retried { job_id: stored.id.clone(), retries: 1 });

    clock.advance_secs(1);
    queue.promote_scheduled().await.expect("sweep");

    let outcome = pool.process_next().await.expect("process").expect("outcome");
    assert_eq!(
        outcome,
        JobOutcome::DeadLettered { job_id: stored.id, reason: MAX_RETRIES_EXCEEDED.to_string() }
    );
    assert!(pool.process_next().await.expect("process").is_none());

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let stats = pool.stats();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.dead_lettered, 1);
}

/// Validates that a job with no registered handler is dead-lettered, not retried.
#[tokio::test]
async fn test_unhandled_job_type_goes_to_dead_letter() {
    let (queue, _clock) = harness();
    let pool = WorkerPool::new(Arc::clone(&queue), WorkerConfig::default()).expect("pool");

    queue.enqueue(Job::new("unknown", Priority::High, Payload::new())).await.expect("enqueue");
    let outcome = pool.process_next().await.expect("process").expect("outcome");
    assert!(matches!(
        outcome,
        JobOutcome::DeadLettered { ref reason, .. } if reason == NO_HANDLER_FOUND
    ));

    let dead = queue.peek_dead_letter(1).await.expect("dead letter");
    assert_eq!(dead[0].retries, 0);
    assert_eq!(dead[0].failure_reason(), Some(NO_HANDLER_FOUND));
    assert_eq!(queue.scheduled_size().await.expect("scheduled"), 0);
}
