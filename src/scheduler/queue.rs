//! Priority queue of pending job ids.
//!
//! A typed view over the coordination store's ordered-queue primitive:
//!
//! - Higher priority dequeues first
//! - Equal priorities dequeue in insertion order
//! - `pop` is atomic: exactly one caller receives a given id
//!
//! An entry exists only while the referenced job is `pending` or `retrying`;
//! `JobRepository` is responsible for keeping that true.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{CoordinationStore, Keyspace};

/// A queued job id and its priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueEntry {
    pub job_id: Uuid,
    pub priority: i32,
}

/// Store-backed priority queue of job ids.
#[derive(Clone)]
pub struct PriorityQueue {
    store: Arc<dyn CoordinationStore>,
    key: String,
}

impl PriorityQueue {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: &Keyspace) -> Self {
        Self {
            store,
            key: keys.queue(),
        }
    }

    /// Inserts a job id. Returns `false` if it was already queued.
    pub async fn push(&self, job_id: Uuid, priority: i32) -> Result<bool, StoreError> {
        self.store
            .queue_push(&self.key, &job_id.to_string(), priority)
            .await
    }

    /// Removes and returns the next job id, or `None` when the queue is empty.
    pub async fn pop(&self) -> Result<Option<Uuid>, StoreError> {
        match self.store.queue_pop(&self.key).await? {
            Some(member) => self.parse(&member).map(Some),
            None => Ok(None),
        }
    }

    /// Removes a job id, returning whether it was queued.
    pub async fn remove(&self, job_id: Uuid) -> Result<bool, StoreError> {
        self.store
            .queue_remove(&self.key, &job_id.to_string())
            .await
    }

    pub async fn contains(&self, job_id: Uuid) -> Result<bool, StoreError> {
        self.store
            .queue_contains(&self.key, &job_id.to_string())
            .await
    }

    /// Returns the number of queued jobs.
    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.queue_len(&self.key).await
    }

    /// Returns whether the queue is empty.
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Peeks at the next `limit` entries in dequeue order without removing them.
    pub async fn peek(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        self.store
            .queue_peek(&self.key, limit)
            .await?
            .into_iter()
            .map(|(member, priority)| {
                Ok(QueueEntry {
                    job_id: self.parse(&member)?,
                    priority,
                })
            })
            .collect()
    }

    /// Returns the store key backing the queue.
    pub fn name(&self) -> &str {
        &self.key
    }

    fn parse(&self, member: &str) -> Result<Uuid, StoreError> {
        Uuid::parse_str(member).map_err(|e| StoreError::Corrupt {
            key: self.key.clone(),
            message: format!("queue member '{}' is not a job id: {}", member, e),
        })
    }
}
