//! Point-in-time metrics snapshot
//!
//! [`SnapshotCollector`] gathers breaker states and counts, rate-limiter
//! token levels, queue sizes and worker counters into one serializable
//! [`MetricsSnapshot`]. Components are registered once at startup; the
//! collector only reads them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stack_common::resilience::{
    BreakerRegistry, BreakerSnapshot, CircuitBreaker, RateLimiter, RateLimiterSnapshot,
};
use tracing::debug;

use crate::jobs::{JobQueue, JobQueueResult, QueueSnapshot, WorkerCounters, WorkerStats};

/// Everything observable about the resilience layer at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub breakers: Vec<BreakerSnapshot>,
    pub rate_limiters: Vec<RateLimiterSnapshot>,
    pub queue: Option<QueueSnapshot>,
    pub workers: Option<WorkerStats>,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Read-only view over the registered components
#[derive(Debug, Default, Clone)]
pub struct SnapshotCollector {
    registry: Option<BreakerRegistry>,
    breakers: Vec<Arc<CircuitBreaker>>,
    limiters: Vec<Arc<RateLimiter>>,
    queue: Option<Arc<JobQueue>>,
    workers: Option<Arc<WorkerCounters>>,
}

impl SnapshotCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include every breaker in `registry`, including ones created later
    #[must_use]
    pub fn with_registry(mut self, registry: BreakerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breakers.push(breaker);
        self
    }

    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiters.push(limiter);
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: Arc<JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    #[must_use]
    pub fn with_workers(mut self, counters: Arc<WorkerCounters>) -> Self {
        self.workers = Some(counters);
        self
    }

    /// Take a snapshot; only the queue sizes touch the backend
    pub async fn collect(&self) -> JobQueueResult<MetricsSnapshot> {
        let mut breakers: Vec<BreakerSnapshot> =
            self.registry.as_ref().map(BreakerRegistry::snapshots).unwrap_or_default();
        for breaker in &self.breakers {
            if !breakers.iter().any(|existing| existing.name == breaker.name()) {
                breakers.push(breaker.snapshot());
            }
        }
        breakers.sort_by(|a, b| a.name.cmp(&b.name));

        let mut rate_limiters: Vec<RateLimiterSnapshot> =
            self.limiters.iter().map(|limiter| limiter.snapshot()).collect();
        rate_limiters.sort_by(|a, b| a.name.cmp(&b.name));

        let queue = match &self.queue {
            Some(queue) => Some(queue.snapshot().await?),
            None => None,
        };

        let snapshot = MetricsSnapshot {
            taken_at: Utc::now(),
            breakers,
            rate_limiters,
            queue,
            workers: self.workers.as_ref().map(|counters| counters.snapshot()),
        };
        debug!(
            breakers = snapshot.breakers.len(),
            rate_limiters = snapshot.rate_limiters.len(),
            "Collected metrics snapshot"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use stack_common::resilience::{CircuitBreakerSettings, CircuitState, RateLimiterConfig};

    use super::*;
    use crate::jobs::{Job, Payload, Priority};

    #[tokio::test]
    async fn snapshot_covers_every_component() {
        let registry = BreakerRegistry::default();
        let custody = registry.get_or_create("custody");
        let _ = custody.call(|| Err::<(), _>("down"));

        let kyc = Arc::new(CircuitBreaker::new(CircuitBreakerSettings::new("kyc")));
        let limiter =
            Arc::new(RateLimiter::new("inference", RateLimiterConfig::new(60, 5)).expect("limiter"));
        let queue = Arc::new(JobQueue::in_memory());
        queue.enqueue(Job::new("notify", Priority::High, Payload::new())).await.expect("enqueue");

        let collector = SnapshotCollector::new()
            .with_registry(registry)
            .with_breaker(kyc)
            .with_limiter(Arc::clone(&limiter))
            .with_queue(queue)
            .with_workers(Arc::new(WorkerCounters::default()));

        let snapshot = collector.collect().await.expect("snapshot");
        let names: Vec<&str> = snapshot.breakers.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["custody", "kyc"]);
        assert_eq!(snapshot.breakers[0].counts.total_failures, 1);
        assert_eq!(snapshot.breakers[1].state, CircuitState::Closed);
        assert_eq!(snapshot.rate_limiters[0].tokens_available, 5);
        assert_eq!(snapshot.rate_limiters[0].capacity, 5);

        let queue = snapshot.queue.as_ref().expect("queue snapshot");
        assert_eq!(queue.lanes["high"], 1);
        assert_eq!(queue.dead_letter, 0);
        assert_eq!(snapshot.workers, Some(WorkerStats::default()));
        limiter.shutdown();
    }

    #[tokio::test]
    async fn snapshot_serializes_state_as_string() {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerSettings::new("fiat")));
        let snapshot = SnapshotCollector::new().with_breaker(breaker).collect().await.expect("snapshot");

        let value: serde_json::Value =
            serde_json::from_str(&snapshot.to_json().expect("json")).expect("parse");
        assert_eq!(value["breakers"][0]["state"], "Closed");
        assert!(value["queue"].is_null());
    }
}
