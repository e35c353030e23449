//! In-process queue backend
//!
//! Every list and sorted set sits behind its own `parking_lot::Mutex`, looked
//! up through a `DashMap`, so producers and consumers of different lanes never
//! contend on a shared lock.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use stack_common::error::CommonResult;

use super::backend::QueueBackend;

type List = Arc<Mutex<VecDeque<String>>>;
type SortedSet = Arc<Mutex<BTreeSet<(i64, String)>>>;

/// Queue backend held entirely in memory
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    lists: Arc<DashMap<String, List>>,
    sets: Arc<DashMap<String, SortedSet>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, key: &str) -> List {
        if let Some(list) = self.lists.get(key) {
            return Arc::clone(list.value());
        }
        Arc::clone(self.lists.entry(key.to_string()).or_default().value())
    }

    fn set(&self, key: &str) -> SortedSet {
        if let Some(set) = self.sets.get(key) {
            return Arc::clone(set.value());
        }
        Arc::clone(self.sets.entry(key.to_string()).or_default().value())
    }
}

#[async_trait]
impl QueueBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn push(&self, list: &str, member: String) -> CommonResult<()> {
        self.list(list).lock().push_back(member);
        Ok(())
    }

    async fn pop(&self, list: &str) -> CommonResult<Option<String>> {
        Ok(self.lists.get(list).and_then(|list| list.lock().pop_front()))
    }

    async fn list_len(&self, list: &str) -> CommonResult<u64> {
        Ok(self
            .lists
            .get(list)
            .map_or(0, |list| u64::try_from(list.lock().len()).unwrap_or(u64::MAX)))
    }

    async fn list_head(&self, list: &str, limit: usize) -> CommonResult<Vec<String>> {
        Ok(self
            .lists
            .get(list)
            .map(|list| list.lock().iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn schedule(&self, set: &str, member: String, score: i64) -> CommonResult<()> {
        let set = self.set(set);
        let mut members = set.lock();
        // Same member, new score: sorted-set semantics replace the entry.
        members.retain(|(_, existing)| existing != &member);
        members.insert((score, member));
        Ok(())
    }

    async fn claim_due(&self, set: &str, max_score: i64) -> CommonResult<Vec<String>> {
        let Some(set) = self.sets.get(set).map(|set| Arc::clone(set.value())) else {
            return Ok(Vec::new());
        };
        let mut members = set.lock();
        let mut claimed = Vec::new();
        while let Some(first) = members.first() {
            if first.0 > max_score {
                break;
            }
            if let Some((_, member)) = members.pop_first() {
                claimed.push(member);
            }
        }
        Ok(claimed)
    }

    async fn set_len(&self, set: &str) -> CommonResult<u64> {
        Ok(self
            .sets
            .get(set)
            .map_or(0, |set| u64::try_from(set.lock().len()).unwrap_or(u64::MAX)))
    }
}
