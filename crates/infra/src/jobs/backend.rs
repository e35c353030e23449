//! Storage port for the job queue
//!
//! The queue only needs two structures: FIFO lists (one per priority plus the
//! dead-letter list) and one sorted set scored by Unix seconds. Each method
//! must be atomic on its own collection; the queue never takes a lock that
//! spans collections.

use async_trait::async_trait;
use stack_common::error::CommonResult;

/// List and sorted-set operations the queue is built on
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Backend name used in logs and error messages
    fn name(&self) -> &'static str;

    /// Append `member` to the tail of `list`
    async fn push(&self, list: &str, member: String) -> CommonResult<()>;

    /// Remove and return the head of `list`
    async fn pop(&self, list: &str) -> CommonResult<Option<String>>;

    /// Number of members in `list`
    async fn list_len(&self, list: &str) -> CommonResult<u64>;

    /// Up to `limit` members from the head of `list`, oldest first
    async fn list_head(&self, list: &str, limit: usize) -> CommonResult<Vec<String>>;

    /// Add `member` to `set` with `score`
    async fn schedule(&self, set: &str, member: String, score: i64) -> CommonResult<()>;

    /// Remove and return every member of `set` scored at or below `max_score`
    ///
    /// A member is returned to exactly one caller even when several sweeps
    /// race on the same set.
    async fn claim_due(&self, set: &str, max_score: i64) -> CommonResult<Vec<String>>;

    /// Number of members in `set`
    async fn set_len(&self, set: &str) -> CommonResult<u64>;
}
