//! Standalone job worker
//!
//! Loads configuration (environment, then config file, then defaults), starts
//! the worker pool and recurring schedules, and logs a metrics snapshot every
//! sweep interval until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use stack_infra::config::{self, BackendKind, StackConfig};
use stack_infra::jobs::{
    HandlerError, InMemoryBackend, Job, JobQueue, QueueBackend, RecurringScheduler, WorkerPool,
};
use stack_infra::logging;
use stack_infra::observability::SnapshotCollector;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let (config, load_error) = match config::load() {
        Ok(config) => (config, None),
        Err(e) => (StackConfig::default(), Some(e)),
    };
    logging::init(&config.log).context("failed to initialise logging")?;
    if let Some(e) = load_error {
        warn!(error = %e, "No usable configuration found, running with defaults");
    }

    let backend = connect_backend(&config).await?;
    let queue = Arc::new(JobQueue::new(backend).with_settings(config.queue.settings()));
    info!(backend = queue.backend_name(), "Job queue ready");

    let mut pool = WorkerPool::new(Arc::clone(&queue), config.worker.clone())
        .context("invalid worker configuration")?;
    pool.register("noop", |job: Job, _cancel: CancellationToken| async move {
        info!(job_id = %job.id, "noop job handled");
        Ok::<(), HandlerError>(())
    });

    let mut recurring = RecurringScheduler::new(Arc::clone(&queue));
    for job in config.recurring.iter().cloned() {
        let name = job.name.clone();
        recurring.add(job).await.with_context(|| format!("invalid recurring job '{name}'"))?;
    }

    let registry = config.breaker.registry();
    let collector = SnapshotCollector::new()
        .with_registry(registry)
        .with_queue(Arc::clone(&queue))
        .with_workers(pool.counters());

    pool.start().await.context("failed to start worker pool")?;
    if !recurring.names().is_empty() {
        recurring.start().await.context("failed to start recurring scheduler")?;
    }

    let shutdown = CancellationToken::new();
    let reporter = {
        let shutdown = shutdown.clone();
        let period = config.worker.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match collector.collect().await {
                        Ok(snapshot) => match snapshot.to_json() {
                            Ok(json) => info!(snapshot = %json, "Metrics snapshot"),
                            Err(e) => warn!(error = %e, "Failed to encode metrics snapshot"),
                        },
                        Err(e) => warn!(error = %e, "Failed to collect metrics snapshot"),
                    },
                }
            }
        })
    };

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    shutdown.cancel();
    if recurring.is_running() {
        recurring.stop().await.context("failed to stop recurring scheduler")?;
    }
    pool.stop().await.context("failed to stop worker pool")?;
    reporter.await.context("metrics reporter panicked")?;

    info!(stats = ?pool.stats(), "Worker stopped");
    Ok(())
}

async fn connect_backend(config: &StackConfig) -> Result<Arc<dyn QueueBackend>> {
    match config.queue.backend {
        BackendKind::Memory => Ok(Arc::new(InMemoryBackend::new())),
        #[cfg(feature = "redis")]
        BackendKind::Redis => {
            let url = config.queue.redis_url.as_deref().context("queue.redis_url is not set")?;
            let backend = stack_infra::jobs::RedisBackend::connect(url)
                .await
                .context("failed to connect to redis")?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "redis"))]
        BackendKind::Redis => {
            anyhow::bail!("redis backend requested but the `redis` feature is disabled")
        }
    }
}
