//! Client-facing job operations.
//!
//! `JobService` is what the CLI (or any embedding application) talks to:
//! submit a job, look one up, cancel it, and read queue statistics.

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::job::{CancelOutcome, Job, SubmitRequest};
use super::registry::WorkerRegistry;
use super::repository::JobRepository;
use crate::error::{JobError, WorkerError};

/// Point-in-time queue and fleet counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Jobs whose record is `pending` or `retrying`.
    pub pending_jobs: usize,
    /// Entries in the priority queue. Can briefly differ from `pending_jobs`
    /// while a claim or a monitor repair is in progress.
    pub queue_depth: usize,
    /// Job records currently kept; finished jobs drop out once pruned.
    pub total_jobs: usize,
    pub active_workers: usize,
    pub total_workers: usize,
}

/// Facade over the repository and registry for job clients.
#[derive(Clone)]
pub struct JobService {
    repository: JobRepository,
    registry: WorkerRegistry,
}

impl JobService {
    pub fn new(repository: JobRepository, registry: WorkerRegistry) -> Self {
        Self {
            repository,
            registry,
        }
    }

    pub fn repository(&self) -> &JobRepository {
        &self.repository
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Submits a job and returns its id.
    ///
    /// # Errors
    ///
    /// `JobError::Validation` for a malformed request (nothing is written);
    /// store errors when the coordination store is unavailable.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Uuid, JobError> {
        self.repository.submit(request).await
    }

    /// Returns the current job record.
    pub async fn get_status(&self, job_id: Uuid) -> Result<Job, JobError> {
        self.repository.get(job_id).await
    }

    /// Cancels a job that has not been picked up yet.
    ///
    /// Assigned and running jobs are unaffected and reported as
    /// `CancelOutcome::AlreadyAssigned`.
    ///
    /// # Errors
    ///
    /// `JobError::NotFound` for an unknown id.
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, JobError> {
        let outcome = self.repository.cancel(job_id).await?;
        debug!(job_id = %job_id, outcome = ?outcome, "Cancel requested");
        Ok(outcome)
    }

    /// Returns pending and total job counts, queue depth and worker counts.
    ///
    /// Job counts come from job status, the same source as
    /// `MetricsSnapshot::pending_jobs`.
    pub async fn queue_stats(&self) -> Result<QueueStats, WorkerError> {
        let jobs = self.repository.status_counts().await?;
        let queue_depth = self.repository.queue().len().await?;
        let workers = self.registry.counts().await?;

        Ok(QueueStats {
            pending_jobs: jobs.waiting(),
            queue_depth,
            total_jobs: jobs.total,
            active_workers: workers.active,
            total_workers: workers.total,
        })
    }
}
