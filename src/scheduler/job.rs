//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Job`: The persisted job record
//! - `SubmitRequest`: Validated description of a job to submit
//! - `JobStatus`: Lifecycle state of a job
//!
//! The state transitions live here as plain methods on `Job` so they can be
//! unit tested without a store. `JobRepository` is the only caller; it wraps
//! each transition in a compare-and-swap on the record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// Default maximum number of re-queues after a failure.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default priority for jobs (0 is normal priority).
pub const DEFAULT_PRIORITY: i32 = 0;

/// Default extraction timeout when the config blob does not set one.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3600;

/// Upper bound accepted for `max_retries` on submission.
const MAX_RETRIES_LIMIT: u32 = 100;

/// Error recorded on jobs reclaimed from a worker that stopped heartbeating.
pub const WORKER_LOST_ERROR: &str = "worker lost";

/// Lifecycle state of a job.
///
/// ```text
/// pending -> assigned -> running -> completed
///                               \-> failed -> retrying -> (queue) -> assigned ...
///                                          \-> failed (terminal, budget exhausted)
/// pending/retrying -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue.
    Pending,
    /// Popped from the queue and owned by a worker.
    Assigned,
    /// The owning worker started extraction.
    Running,
    /// Extraction succeeded.
    Completed,
    /// Failed with the retry budget exhausted.
    Failed,
    /// Failed under budget and re-queued.
    Retrying,
    /// Cancelled while still queued.
    Cancelled,
}

impl JobStatus {
    /// All states, in lifecycle order.
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Assigned,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retrying,
        JobStatus::Cancelled,
    ];

    /// Returns whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns whether a queue entry should exist for a job in this state.
    pub fn is_queued(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying)
    }

    /// Returns whether the job is owned by a worker.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Assigned | JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of a job to submit.
///
/// Validated before anything is written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Display name.
    pub name: String,
    /// Extraction template reference.
    pub template_id: String,
    /// Page to extract from.
    pub target_url: String,
    /// Opaque configuration handed to the extraction collaborator.
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
    /// Higher values dequeue first.
    #[serde(default)]
    pub priority: i32,
    /// Number of re-queues allowed after failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl SubmitRequest {
    /// Creates a request with default priority, retries and an empty config.
    pub fn new(
        name: impl Into<String>,
        template_id: impl Into<String>,
        target_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            template_id: template_id.into(),
            target_url: target_url.into(),
            config: empty_config(),
            priority: DEFAULT_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Sets the configuration blob.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Checks the request is well formed.
    ///
    /// # Errors
    ///
    /// Returns `JobError::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.name.trim().is_empty() {
            return Err(JobError::Validation("name cannot be empty".to_string()));
        }

        if self.template_id.trim().is_empty() {
            return Err(JobError::Validation(
                "template_id cannot be empty".to_string(),
            ));
        }

        let url = reqwest::Url::parse(&self.target_url).map_err(|e| {
            JobError::Validation(format!("target_url '{}' is invalid: {}", self.target_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(JobError::Validation(format!(
                "target_url must use http or https, got '{}'",
                url.scheme()
            )));
        }

        let Some(config) = self.config.as_object() else {
            return Err(JobError::Validation(
                "config must be a JSON object".to_string(),
            ));
        };

        if let Some(timeout) = config.get("timeout_seconds") {
            match timeout.as_u64() {
                Some(secs) if secs > 0 => {}
                _ => {
                    return Err(JobError::Validation(
                        "config.timeout_seconds must be a positive integer".to_string(),
                    ))
                }
            }
        }

        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(JobError::Validation(format!(
                "max_retries must be at most {}",
                MAX_RETRIES_LIMIT
            )));
        }

        Ok(())
    }
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The job went back to the queue as `retrying`.
    Requeued { retry_count: u32 },
    /// The budget is exhausted; the job is terminally `failed`.
    Exhausted,
}

/// Outcome of cancelling a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was removed from the queue and is now `cancelled`.
    Cancelled,
    /// The job is owned by a worker and will run to completion or timeout.
    AlreadyAssigned,
    /// The job had already reached a terminal state.
    AlreadyFinished,
}

/// A job record as persisted in the coordination store.
///
/// Invariant: `assigned_worker` is `Some` if and only if `status` is
/// `assigned` or `running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, generated at submission.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Extraction template reference.
    pub template_id: String,
    /// Page to extract from.
    pub target_url: String,
    /// Opaque configuration handed to the extraction collaborator.
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
    pub status: JobStatus,
    /// Worker currently owning the job.
    #[serde(default)]
    pub assigned_worker: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Refreshed by every transition.
    pub updated_at: DateTime<Utc>,
    /// Number of times the job went back to the queue after a failure.
    pub retry_count: u32,
    pub max_retries: u32,
    /// Higher values dequeue first.
    pub priority: i32,
    /// Payload returned by the extraction collaborator.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Last error, kept across retries for diagnosis.
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    /// Builds a fresh `pending` record from a submission.
    pub fn from_request(request: SubmitRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            template_id: request.template_id,
            target_url: request.target_url,
            config: request.config,
            status: JobStatus::Pending,
            assigned_worker: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            retry_count: 0,
            max_retries: request.max_retries,
            priority: request.priority,
            result: None,
            error: None,
        }
    }

    /// Extraction timeout taken from `config.timeout_seconds`.
    pub fn timeout(&self) -> Duration {
        self.timeout_or(Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS))
    }

    /// Like `timeout`, with a caller-supplied fallback.
    pub fn timeout_or(&self, fallback: Duration) -> Duration {
        self.config
            .get("timeout_seconds")
            .and_then(serde_json::Value::as_u64)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(fallback)
    }

    /// Returns the number of re-queues still allowed.
    pub fn remaining_retries(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Returns how long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// Returns whether `worker_id` currently owns the job.
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.status.is_active() && self.assigned_worker.as_deref() == Some(worker_id)
    }

    fn invalid(&self, to: JobStatus) -> JobError {
        JobError::InvalidTransition {
            job_id: self.id,
            from: self.status,
            to,
        }
    }

    fn ensure_owner(&self, worker_id: &str) -> Result<(), JobError> {
        if self.is_owned_by(worker_id) {
            Ok(())
        } else {
            Err(JobError::NotOwner {
                job_id: self.id,
                worker_id: worker_id.to_string(),
            })
        }
    }

    /// `pending|retrying -> assigned`.
    pub fn assign(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<(), JobError> {
        if !self.status.is_queued() {
            return Err(self.invalid(JobStatus::Assigned));
        }
        self.status = JobStatus::Assigned;
        self.assigned_worker = Some(worker_id.to_string());
        self.updated_at = now;
        Ok(())
    }

    /// `assigned -> running`, owner only.
    pub fn start(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<(), JobError> {
        self.ensure_owner(worker_id)?;
        if self.status != JobStatus::Assigned {
            return Err(self.invalid(JobStatus::Running));
        }
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `assigned|running -> completed`, owner only.
    pub fn complete(
        &mut self,
        worker_id: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        self.ensure_owner(worker_id)?;
        self.status = JobStatus::Completed;
        self.assigned_worker = None;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Records a failed attempt, owner only.
    ///
    /// This is the single retry policy: the attempt is re-queued as
    /// `retrying` while `retry_count + 1 <= max_retries`, otherwise the job
    /// becomes terminally `failed`. Either way the assignment is released.
    pub fn fail(
        &mut self,
        worker_id: &str,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, JobError> {
        self.ensure_owner(worker_id)?;
        Ok(self.record_failure(error.into(), JobStatus::Retrying, now))
    }

    /// Releases a job held by a lost worker, returning it to `pending`.
    ///
    /// Only applies while `worker_id` still owns the job, which makes
    /// repeated reclaims of the same worker no-ops.
    pub fn reclaim(
        &mut self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, JobError> {
        self.ensure_owner(worker_id)?;
        Ok(self.record_failure(WORKER_LOST_ERROR.to_string(), JobStatus::Pending, now))
    }

    fn record_failure(
        &mut self,
        error: String,
        requeue_as: JobStatus,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        self.assigned_worker = None;
        self.error = Some(error);
        self.updated_at = now;

        let attempt = self.retry_count + 1;
        if attempt <= self.max_retries {
            self.retry_count = attempt;
            self.status = requeue_as;
            FailureOutcome::Requeued {
                retry_count: attempt,
            }
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            FailureOutcome::Exhausted
        }
    }

    /// `pending|retrying -> cancelled`.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        if !self.status.is_queued() {
            return Err(self.invalid(JobStatus::Cancelled));
        }
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Refreshes `updated_at` without changing state.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SubmitRequest {
        SubmitRequest::new("product page", "tpl-products", "https://example.com/p/1")
    }

    fn assigned_job(worker: &str) -> Job {
        let mut job = Job::from_request(request(), Utc::now());
        job.assign(worker, Utc::now()).expect("assign");
        job
    }

    #[test]
    fn test_submit_request_defaults() {
        let req = request();
        assert_eq!(req.priority, 0);
        assert_eq!(req.max_retries, 3);
        assert!(req.config.as_object().is_some_and(|m| m.is_empty()));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_submit_request_validation() {
        assert!(SubmitRequest::new(" ", "tpl", "https://a.b")
            .validate()
            .is_err());
        assert!(SubmitRequest::new("n", "", "https://a.b").validate().is_err());
        assert!(SubmitRequest::new("n", "tpl", "not a url")
            .validate()
            .is_err());
        assert!(SubmitRequest::new("n", "tpl", "ftp://a.b/file")
            .validate()
            .is_err());
        assert!(request()
            .with_config(serde_json::json!([1, 2]))
            .validate()
            .is_err());
        assert!(request()
            .with_config(serde_json::json!({"timeout_seconds": 0}))
            .validate()
            .is_err());
        assert!(request().with_max_retries(1000).validate().is_err());
    }

    #[test]
    fn test_job_from_request() {
        let now = Utc::now();
        let job = Job::from_request(request().with_priority(7), now);

        assert!(!job.id.is_nil());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 7);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.created_at, now);
        assert!(job.assigned_worker.is_none());
        assert_eq!(job.timeout(), Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS));
    }

    #[test]
    fn test_timeout_from_config() {
        let job = Job::from_request(
            request().with_config(serde_json::json!({"timeout_seconds": 45})),
            Utc::now(),
        );
        assert_eq!(job.timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = assigned_job("w1");
        assert_eq!(job.status, JobStatus::Assigned);
        assert_eq!(job.assigned_worker.as_deref(), Some("w1"));

        job.start("w1", Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());

        job.complete("w1", serde_json::json!({"items": 3}), Utc::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.assigned_worker.is_none());
        assert!(job.completed_at.is_some());
        assert_eq!(job.result, Some(serde_json::json!({"items": 3})));
    }

    #[test]
    fn test_assign_requires_queued_state() {
        let mut job = assigned_job("w1");
        let err = job.assign("w2", Utc::now()).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        assert_eq!(job.assigned_worker.as_deref(), Some("w1"));
    }

    #[test]
    fn test_transitions_are_fenced_by_owner() {
        let mut job = assigned_job("w1");
        assert!(matches!(
            job.start("w2", Utc::now()),
            Err(JobError::NotOwner { .. })
        ));
        assert!(matches!(
            job.complete("w2", serde_json::Value::Null, Utc::now()),
            Err(JobError::NotOwner { .. })
        ));
        assert!(matches!(
            job.fail("w2", "boom", Utc::now()),
            Err(JobError::NotOwner { .. })
        ));
    }

    #[test]
    fn test_retry_budget() {
        let mut job = Job::from_request(request().with_max_retries(3), Utc::now());

        for expected in 1..=3 {
            job.assign("w1", Utc::now()).unwrap();
            let outcome = job.fail("w1", "selector missing", Utc::now()).unwrap();
            assert_eq!(
                outcome,
                FailureOutcome::Requeued {
                    retry_count: expected
                }
            );
            assert_eq!(job.status, JobStatus::Retrying);
            assert!(job.assigned_worker.is_none());
        }

        job.assign("w1", Utc::now()).unwrap();
        let outcome = job.fail("w1", "selector missing", Utc::now()).unwrap();
        assert_eq!(outcome, FailureOutcome::Exhausted);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
        assert!(job.retry_count <= job.max_retries);
        assert!(job.assign("w1", Utc::now()).is_err());
    }

    #[test]
    fn test_zero_retry_budget_fails_immediately() {
        let mut job = Job::from_request(request().with_max_retries(0), Utc::now());
        job.assign("w1", Utc::now()).unwrap();
        assert_eq!(
            job.fail("w1", "boom", Utc::now()).unwrap(),
            FailureOutcome::Exhausted
        );
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn test_reclaim_returns_to_pending_once() {
        let mut job = assigned_job("w1");
        let outcome = job.reclaim("w1", Utc::now()).unwrap();
        assert_eq!(outcome, FailureOutcome::Requeued { retry_count: 1 });
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.assigned_worker.is_none());
        assert_eq!(job.error.as_deref(), Some(WORKER_LOST_ERROR));

        // Second reclaim against the same worker is rejected.
        assert!(job.reclaim("w1", Utc::now()).is_err());
        assert_eq!(job.retry_count, 1);
    }

    #[test]
    fn test_cancel() {
        let mut job = Job::from_request(request(), Utc::now());
        job.cancel(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.status.is_terminal());

        let mut running = assigned_job("w1");
        assert!(running.cancel(Utc::now()).is_err());
    }

    #[test]
    fn test_job_status_display_and_serde() {
        assert_eq!(format!("{}", JobStatus::Retrying), "retrying");
        let json = serde_json::to_string(&JobStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        for status in JobStatus::ALL {
            assert_eq!(
                status.is_active(),
                matches!(status, JobStatus::Assigned | JobStatus::Running)
            );
        }
    }

    #[test]
    fn test_job_serialization() {
        let job = assigned_job("w1");
        let json = serde_json::to_string(&job).expect("serialization should work");
        let parsed: Job = serde_json::from_str(&json).expect("deserialization should work");
        assert_eq!(parsed, job);
    }
}
