//! Error types for crawlfleet operations.
//!
//! Defines the error taxonomy shared by all subsystems:
//! - Coordination store access (transient vs. permanent failures)
//! - Job record transitions and submission validation
//! - Worker registration and heartbeats
//! - Extraction collaborator failures and timeouts
//! - Auto-scaling and fleet management

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobStatus;

/// Errors raised by a coordination store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, dropped, timed out).
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected a command (script error, wrong type, ...).
    #[error("Coordination store command failed: {0}")]
    Command(String),

    /// A stored value could not be decoded.
    #[error("Stored value for '{key}' is corrupt: {message}")]
    Corrupt { key: String, message: String },

    /// A record could not be encoded.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Optimistic updates kept losing to concurrent writers.
    #[error("Too many concurrent updates to '{0}'")]
    Contention(String),
}

impl StoreError {
    /// Returns whether retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Contention(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Errors that can occur while submitting or transitioning jobs.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Invalid job submission: {0}")]
    Validation(String),

    /// The caller no longer holds the assignment (the job was reclaimed).
    #[error("Job {job_id} is not assigned to worker '{worker_id}'")]
    NotOwner { job_id: Uuid, worker_id: String },

    #[error("Invalid transition for job {job_id} from '{from}' to '{to}'")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
}

impl JobError {
    /// Returns whether the failure came from a transient store condition.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Store(e) if e.is_transient())
    }
}

/// Errors that can occur in the worker registry and runtime.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("Worker '{0}' is not registered")]
    NotFound(String),

    /// The registration was marked stale; the process must re-register.
    #[error("Worker '{0}' registration is stale")]
    Stale(String),
}

impl WorkerError {
    /// Returns whether retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerError::Store(e) => e.is_transient(),
            WorkerError::Job(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Errors reported by the extraction collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractionError {
    #[error("Extraction failed: {0}")]
    Failure(String),

    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors that can occur while evaluating or applying scaling decisions.
#[derive(Debug, Error)]
pub enum ScalingError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Fleet manager rejected target {target}: {message}")]
    Fleet { target: usize, message: String },
}

impl ScalingError {
    /// Returns whether retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ScalingError::Store(e) => e.is_transient(),
            ScalingError::Job(e) => e.is_transient(),
            ScalingError::Worker(e) => e.is_transient(),
            ScalingError::Fleet { .. } => false,
        }
    }
}
