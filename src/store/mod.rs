//! Coordination store abstraction.
//!
//! Every cross-process fact (job records, the priority queue, worker
//! registrations, per-worker job sets, the scaler cooldown) lives in a shared
//! key-value store. This module defines the primitives the rest of the crate
//! relies on and provides two backends:
//!
//! - [`RedisStore`]: production backend; multi-step primitives run as Lua
//!   scripts so each one is atomic on the server
//! - [`MemoryStore`]: in-process backend for tests and single-node runs
//!
//! # Ordered queue semantics
//!
//! `queue_pop` returns the member with the highest priority. Members sharing a
//! priority pop in push order, using a sequence number assigned by the store.
//! Pushing a member that is already queued is a no-op.

mod memory;
mod redis_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Atomic primitives offered by a coordination store.
///
/// Each method is atomic with respect to the key it touches.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Reads a value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a value unconditionally.
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Deletes a key, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Replaces the value of `key` with `new` only if it currently equals
    /// `expected` (`None` meaning absent). `new = None` deletes the key.
    ///
    /// Returns `false` when the current value did not match.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Inserts `member` into the ordered queue. Returns `false` if it was
    /// already present.
    async fn queue_push(&self, queue: &str, member: &str, priority: i32)
        -> Result<bool, StoreError>;

    /// Removes and returns the highest-priority, earliest-pushed member.
    async fn queue_pop(&self, queue: &str) -> Result<Option<String>, StoreError>;

    /// Removes `member` from the queue, returning whether it was present.
    async fn queue_remove(&self, queue: &str, member: &str) -> Result<bool, StoreError>;

    /// Returns whether `member` is currently queued.
    async fn queue_contains(&self, queue: &str, member: &str) -> Result<bool, StoreError>;

    /// Number of queued members.
    async fn queue_len(&self, queue: &str) -> Result<usize, StoreError>;

    /// Returns up to `limit` members in pop order with their priorities.
    async fn queue_peek(&self, queue: &str, limit: usize)
        -> Result<Vec<(String, i32)>, StoreError>;

    /// Adds a member to a set, returning whether it was newly added.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Removes a member from a set, returning whether it was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Returns all members of a set (unordered).
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Number of members in a set.
    async fn set_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Round-trips to the store to check it is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Connection settings for the coordination store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix applied to every key written by this crate.
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "crawlfleet".to_string(),
        }
    }
}

/// Key layout inside the coordination store.
///
/// ```text
/// {prefix}:jobs:{job_id}        -> job record (JSON)
/// {prefix}:status:{status}      -> set of job ids currently in that status
/// {prefix}:finished             -> set of days with finished jobs (YYYY-MM-DD)
/// {prefix}:finished:{day}       -> set of job ids that finished on that day
/// {prefix}:queue                -> ordered queue of job ids
/// {prefix}:workers:{worker_id}  -> worker record (JSON)
/// {prefix}:workers              -> set of registered worker ids
/// {prefix}:worker:{id}:jobs     -> set of job ids assigned to the worker
/// {prefix}:autoscaler:last_scale -> timestamp of the last scaling action
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn job(&self, job_id: impl std::fmt::Display) -> String {
        format!("{}:jobs:{}", self.prefix, job_id)
    }

    pub fn jobs_with_status(&self, status: &str) -> String {
        format!("{}:status:{}", self.prefix, status)
    }

    pub fn finished_days(&self) -> String {
        format!("{}:finished", self.prefix)
    }

    pub fn finished_on(&self, day: &str) -> String {
        format!("{}:finished:{}", self.prefix, day)
    }

    pub fn queue(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    pub fn worker(&self, worker_id: &str) -> String {
        format!("{}:workers:{}", self.prefix, worker_id)
    }

    pub fn workers_index(&self) -> String {
        format!("{}:workers", self.prefix)
    }

    pub fn worker_jobs(&self, worker_id: &str) -> String {
        format!("{}:worker:{}:jobs", self.prefix, worker_id)
    }

    pub fn last_scale(&self) -> String {
        format!("{}:autoscaler:last_scale", self.prefix)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(StoreConfig::default().key_prefix)
    }
}
