//! In-process coordination store.
//!
//! Holds all state behind a single async mutex, so every primitive is
//! trivially atomic. Used by the test suite and by single-node deployments
//! where all workers run inside one process.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::CoordinationStore;
use crate::error::StoreError;

/// Pop order: highest priority first, then lowest sequence number.
type QueueKey = (Reverse<i32>, u64);

#[derive(Debug, Default)]
struct MemoryQueue {
    entries: BTreeMap<QueueKey, String>,
    index: HashMap<String, QueueKey>,
    next_seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, String>,
    queues: HashMap<String, MemoryQueue>,
    sets: HashMap<String, HashSet<String>>,
}

/// Coordination store backed by process memory.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        Ok(self.inner.lock().await.values.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner
            .lock()
            .await
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let removed_value = inner.values.remove(key).is_some();
        let removed_set = inner.sets.remove(key).is_some();
        let removed_queue = inner.queues.remove(key).is_some();
        Ok(removed_value || removed_set || removed_queue)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if inner.values.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                inner.values.insert(key.to_string(), value.to_string());
            }
            None => {
                inner.values.remove(key);
            }
        }
        Ok(true)
    }

    async fn queue_push(
        &self,
        queue: &str,
        member: &str,
        priority: i32,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let q = inner.queues.entry(queue.to_string()).or_default();
        if q.index.contains_key(member) {
            return Ok(false);
        }
        q.next_seq += 1;
        let key = (Reverse(priority), q.next_seq);
        q.entries.insert(key, member.to_string());
        q.index.insert(member.to_string(), key);
        Ok(true)
    }

    async fn queue_pop(&self, queue: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let Some(q) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some((_, member)) = q.entries.pop_first() else {
            return Ok(None);
        };
        q.index.remove(&member);
        Ok(Some(member))
    }

    async fn queue_remove(&self, queue: &str, member: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let Some(q) = inner.queues.get_mut(queue) else {
            return Ok(false);
        };
        match q.index.remove(member) {
            Some(key) => {
                q.entries.remove(&key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn queue_contains(&self, queue: &str, member: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .queues
            .get(queue)
            .is_some_and(|q| q.index.contains_key(member)))
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.queues.get(queue).map_or(0, |q| q.entries.len()))
    }

    async fn queue_peek(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<(String, i32)>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .queues
            .get(queue)
            .map(|q| {
                q.entries
                    .iter()
                    .take(limit)
                    .map(|((Reverse(priority), _), member)| (member.clone(), *priority))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let Some(set) = inner.sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            inner.sets.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_len(&self, key: &str) -> Result<usize, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.sets.get(key).map_or(0, HashSet::len))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}
