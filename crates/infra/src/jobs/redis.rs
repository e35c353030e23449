//! Redis queue backend
//!
//! Uses `redis::aio::ConnectionManager` for a multiplexed connection with
//! automatic reconnection. Lists are written with `LPUSH` and consumed with
//! `RPOP`, so the list tail in Redis terms is the queue head. Scheduled jobs
//! are claimed with `ZRANGEBYSCORE` followed by one `ZREM` per member; a
//! member belongs to whichever sweep saw `ZREM` return 1.
//!
//! Requires the `redis` feature flag.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use stack_common::error::{CommonError, CommonResult};
use tracing::debug;

use super::backend::QueueBackend;

/// Queue backend on a Redis (or Redis-compatible) server
#[derive(Clone)]
pub struct RedisBackend {
    connection_manager: ConnectionManager,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").field("connection_manager", &"ConnectionManager").finish()
    }
}

impl RedisBackend {
    /// Connect to `url` (for example `redis://localhost:6379/0`)
    pub async fn connect(url: &str) -> CommonResult<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            CommonError::config_field("queue.redis_url", format!("Invalid Redis URL: {e}"))
        })?;

        let connection_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| backend_error("connect", &e))?;

        debug!(url = %redact_url(url), "Redis queue backend connected");
        Ok(Self { connection_manager })
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn push(&self, list: &str, member: String) -> CommonResult<()> {
        let mut conn = self.connection_manager.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(list)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("LPUSH", &e))?;
        Ok(())
    }

    async fn pop(&self, list: &str) -> CommonResult<Option<String>> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("RPOP")
            .arg(list)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("RPOP", &e))
    }

    async fn list_len(&self, list: &str) -> CommonResult<u64> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("LLEN")
            .arg(list)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("LLEN", &e))
    }

    async fn list_head(&self, list: &str, limit: usize) -> CommonResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection_manager.clone();
        let start = -i64::try_from(limit).unwrap_or(i64::MAX);
        let mut members: Vec<String> = redis::cmd("LRANGE")
            .arg(list)
            .arg(start)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("LRANGE", &e))?;
        members.reverse();
        Ok(members)
    }

    async fn schedule(&self, set: &str, member: String, score: i64) -> CommonResult<()> {
        let mut conn = self.connection_manager.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(set)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("ZADD", &e))?;
        Ok(())
    }

    async fn claim_due(&self, set: &str, max_score: i64) -> CommonResult<Vec<String>> {
        let mut conn = self.connection_manager.clone();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(set)
            .arg("-inf")
            .arg(max_score)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("ZRANGEBYSCORE", &e))?;

        let mut claimed = Vec::with_capacity(due.len());
        for member in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(set)
                .arg(&member)
                .query_async(&mut conn)
                .await
                .map_err(|e| backend_error("ZREM", &e))?;
            if removed == 1 {
                claimed.push(member);
            }
        }
        Ok(claimed)
    }

    async fn set_len(&self, set: &str) -> CommonResult<u64> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("ZCARD")
            .arg(set)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("ZCARD", &e))
    }
}

fn backend_error(command: &str, err: &redis::RedisError) -> CommonError {
    let retryable = err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal();
    CommonError::backend("redis", format!("{command} failed: {err}"), retryable)
}

/// Redact credentials from a Redis URL for logging
fn redact_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let prefix = &url[..=colon_pos];
            let suffix = &url[at_pos..];
            return format!("{prefix}***{suffix}");
        }
    }
    url.to_string()
}
