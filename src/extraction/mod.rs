//! Extraction collaborator interface.
//!
//! The worker runtime treats extraction as a black box: it hands an
//! `ExtractionRequest` to an `Extractor` and records whatever comes back.
//! Errors are ordinary values; an extractor must never panic the worker.
//!
//! `HttpExtractor` is the built-in implementation used by the `worker`
//! command. It fetches the target URL and returns the raw response for
//! downstream template processing.

mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::ExtractionError;
use crate::scheduler::Job;

pub use self::http::{HttpExtractor, HttpExtractorConfig};

/// Everything an extractor needs to process one job attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionRequest {
    pub job_id: Uuid,
    pub template_id: String,
    pub target_url: String,
    /// Opaque per-job configuration.
    pub config: serde_json::Value,
    /// Deadline enforced by the worker runtime around `execute`.
    pub timeout: Duration,
}

impl ExtractionRequest {
    /// Builds the request for a job.
    ///
    /// The timeout comes from the job's `config.timeout_seconds`, falling
    /// back to `default_timeout`.
    pub fn from_job(job: &Job, default_timeout: Duration) -> Self {
        Self {
            job_id: job.id,
            template_id: job.template_id.clone(),
            target_url: job.target_url.clone(),
            config: job.config.clone(),
            timeout: job.timeout_or(default_timeout),
        }
    }
}

/// Executes one extraction attempt.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Runs the extraction and returns its result payload.
    async fn execute(&self, request: &ExtractionRequest)
        -> Result<serde_json::Value, ExtractionError>;
}
