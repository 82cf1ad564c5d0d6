//! Worker registry.
//!
//! Each worker process registers a record under `workers:{id}` and refreshes
//! its `last_heartbeat` on a fixed interval. A record transitions
//! `active -> stale` exactly once, when the heartbeat monitor sees it overdue;
//! there is no way back. A recovering process registers again and gets a new
//! id.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, WorkerError};
use crate::store::{CoordinationStore, Keyspace};

const MAX_UPDATE_ATTEMPTS: usize = 16;

/// Liveness state of a worker registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Stale,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Active => write!(f, "active"),
            WorkerStatus::Stale => write!(f, "stale"),
        }
    }
}

/// A worker registration as persisted in the coordination store.
///
/// The worker's assigned job ids live in a separate set
/// (`worker:{id}:jobs`) maintained by `JobRepository`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    /// Name the process was started with (the id prefix).
    pub name: String,
    /// OS process id, for operators.
    pub pid: u32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: WorkerStatus,
}

impl WorkerRecord {
    /// Time since the last heartbeat.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    /// Returns whether the heartbeat is older than `threshold`.
    pub fn is_overdue(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.heartbeat_age(now) > threshold
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkerStatus::Active
    }
}

/// Worker counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCounts {
    pub total: usize,
    pub active: usize,
    pub stale: usize,
}

/// Store-backed registry of worker processes.
#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<dyn CoordinationStore>,
    keys: Keyspace,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    /// Registers a new worker with a fresh id derived from `name`.
    pub async fn register(&self, name: &str) -> Result<WorkerRecord, WorkerError> {
        let now = Utc::now();
        let record = WorkerRecord {
            id: format!("{}-{}", name, Uuid::new_v4().simple()),
            name: name.to_string(),
            pid: std::process::id(),
            registered_at: now,
            last_heartbeat: now,
            status: WorkerStatus::Active,
        };

        let key = self.keys.worker(&record.id);
        let encoded = serde_json::to_string(&record).map_err(StoreError::from)?;
        if !self.store.compare_and_swap(&key, None, Some(&encoded)).await? {
            return Err(StoreError::Contention(key).into());
        }
        self.store
            .set_add(&self.keys.workers_index(), &record.id)
            .await?;

        info!(worker_id = %record.id, pid = record.pid, "Worker registered");
        Ok(record)
    }

    /// Refreshes `last_heartbeat`.
    ///
    /// # Errors
    ///
    /// `WorkerError::Stale` once the registration has been marked stale, and
    /// `WorkerError::NotFound` if it was removed; both mean the process must
    /// register again.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, WorkerError> {
        let (record, ()) = self
            .update(worker_id, |record| {
                if !record.is_active() {
                    return Err(WorkerError::Stale(record.id.clone()));
                }
                if now > record.last_heartbeat {
                    record.last_heartbeat = now;
                }
                Ok(())
            })
            .await?;
        debug!(worker_id = %worker_id, "Heartbeat recorded");
        Ok(record)
    }

    /// Marks an active worker stale if its heartbeat is older than
    /// `threshold`. The age is re-checked inside the atomic update, so a
    /// heartbeat that lands first wins.
    ///
    /// Returns whether this call performed the transition.
    pub async fn mark_stale_if_overdue(
        &self,
        worker_id: &str,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, WorkerError> {
        let (record, marked) = self
            .update(worker_id, |record| {
                if record.is_active() && record.is_overdue(threshold, now) {
                    record.status = WorkerStatus::Stale;
                    Ok(true)
                } else {
                    Ok(false)
                }
            })
            .await?;

        if marked {
            warn!(
                worker_id = %worker_id,
                heartbeat_age_secs = record.heartbeat_age(now).as_secs(),
                "Worker marked stale"
            );
        }
        Ok(marked)
    }

    /// Loads a worker record.
    pub async fn get(&self, worker_id: &str) -> Result<WorkerRecord, WorkerError> {
        let key = self.keys.worker(worker_id);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| WorkerError::NotFound(worker_id.to_string()))?;
        Ok(decode(&key, &raw)?)
    }

    /// Loads every registered worker.
    pub async fn list(&self) -> Result<Vec<WorkerRecord>, WorkerError> {
        let mut records = Vec::new();
        for worker_id in self.store.set_members(&self.keys.workers_index()).await? {
            match self.get(&worker_id).await {
                Ok(record) => records.push(record),
                Err(WorkerError::NotFound(_)) => {
                    debug!(worker_id = %worker_id, "Index entry without worker record");
                }
                Err(e) => return Err(e),
            }
        }
        records.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        Ok(records)
    }

    /// Counts workers by status.
    pub async fn counts(&self) -> Result<WorkerCounts, WorkerError> {
        let records = self.list().await?;
        let active = records.iter().filter(|r| r.is_active()).count();
        Ok(WorkerCounts {
            total: records.len(),
            active,
            stale: records.len() - active,
        })
    }

    /// Deletes a worker's record, job set and index entry.
    ///
    /// Callers must release the worker's jobs first.
    pub async fn remove(&self, worker_id: &str) -> Result<(), WorkerError> {
        self.store.delete(&self.keys.worker(worker_id)).await?;
        self.store.delete(&self.keys.worker_jobs(worker_id)).await?;
        self.store
            .set_remove(&self.keys.workers_index(), worker_id)
            .await?;
        info!(worker_id = %worker_id, "Worker record removed");
        Ok(())
    }

    async fn update<T, F>(
        &self,
        worker_id: &str,
        mut apply: F,
    ) -> Result<(WorkerRecord, T), WorkerError>
    where
        F: FnMut(&mut WorkerRecord) -> Result<T, WorkerError> + Send,
        T: Send,
    {
        let key = self.keys.worker(worker_id);

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let raw = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| WorkerError::NotFound(worker_id.to_string()))?;
            let mut record = decode(&key, &raw)?;
            let output = apply(&mut record)?;
            let encoded = serde_json::to_string(&record).map_err(StoreError::from)?;

            if self
                .store
                .compare_and_swap(&key, Some(&raw), Some(&encoded))
                .await?
            {
                return Ok((record, output));
            }
        }

        Err(StoreError::Contention(key).into())
    }
}

fn decode(key: &str, raw: &str) -> Result<WorkerRecord, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}
