//! Worker runtime.
//!
//! A worker process runs two independent tasks against the coordination
//! store:
//!
//! - a heartbeat task that refreshes the registration every
//!   `heartbeat_interval`, and registers again under a fresh id if the
//!   monitor has marked the old registration stale
//! - the job loop: claim the next job, mark it running, run the extractor
//!   under the job's timeout, and report the outcome
//!
//! The runtime holds no retry policy of its own. Failed and timed-out
//! attempts are reported through `JobRepository::mark_failed`, which decides
//! between re-queue and terminal failure.
//!
//! On shutdown the job loop stops pulling work and lets the in-flight
//! extraction finish or time out. Heartbeats continue until that job is
//! reported; only then does the worker stop the heartbeat task and
//! deregister.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{FailureOutcome, Job, DEFAULT_JOB_TIMEOUT_SECS};
use super::registry::WorkerRegistry;
use super::repository::JobRepository;
use crate::error::{ExtractionError, JobError, WorkerError};
use crate::extraction::{ExtractionRequest, Extractor};
use crate::metrics::MetricsRecorder;
use crate::utils::{shutdown_channel, sleep_or_shutdown, Backoff, ShutdownSignal};

/// Configuration for a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix of the worker id.
    pub name: String,
    /// How often the registration is refreshed.
    #[serde(with = "crate::config::duration_secs")]
    pub heartbeat_interval: Duration,
    /// Sleep between polls when the queue is empty.
    #[serde(with = "crate::config::duration_secs")]
    pub idle_backoff: Duration,
    /// Extraction timeout for jobs whose config does not set one.
    #[serde(with = "crate::config::duration_secs")]
    pub default_job_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            idle_backoff: Duration::from_secs(5),
            default_job_timeout: Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS),
        }
    }
}

impl WorkerConfig {
    /// Creates a new configuration with the given worker name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the idle backoff.
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Sets the fallback job timeout.
    pub fn with_default_job_timeout(mut self, timeout: Duration) -> Self {
        self.default_job_timeout = timeout;
        self
    }
}

/// Counters for the jobs processed by one worker process.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    /// Failed attempts that hit the extraction timeout (also in `jobs_failed`).
    pub jobs_timed_out: u64,
    /// Results dropped because the job had been reclaimed.
    pub ownership_lost: u64,
    pub average_job_duration: Duration,
}

impl WorkerStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

#[derive(Default)]
struct SharedWorkerStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_timed_out: AtomicU64,
    ownership_lost: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedWorkerStats {
    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration, timed_out: bool) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        if timed_out {
            self.jobs_timed_out.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_lost(&self) {
        self.ownership_lost.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> WorkerStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_job_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        WorkerStats {
            jobs_completed: completed,
            jobs_failed: failed,
            jobs_timed_out: self.jobs_timed_out.load(Ordering::SeqCst),
            ownership_lost: self.ownership_lost.load(Ordering::SeqCst),
            average_job_duration,
        }
    }
}

/// How a processed job ended, from the worker's point of view.
#[derive(Debug)]
enum Outcome {
    Completed(serde_json::Value),
    Failed(ExtractionError),
}

/// A worker process: registration, heartbeat and job loop.
pub struct Worker {
    registry: WorkerRegistry,
    repository: JobRepository,
    extractor: Arc<dyn Extractor>,
    config: WorkerConfig,
    /// Current registration id; replaced on re-registration.
    id: Arc<watch::Sender<Option<String>>>,
    stats: Arc<SharedWorkerStats>,
    recorder: MetricsRecorder,
}

impl Worker {
    pub fn new(
        registry: WorkerRegistry,
        repository: JobRepository,
        extractor: Arc<dyn Extractor>,
        config: WorkerConfig,
    ) -> Self {
        let (id, _) = watch::channel(None);
        Self {
            registry,
            repository,
            extractor,
            config,
            id: Arc::new(id),
            stats: Arc::new(SharedWorkerStats::default()),
            recorder: MetricsRecorder::new(),
        }
    }

    /// Returns the current registration id, if registered.
    pub fn worker_id(&self) -> Option<String> {
        self.id.borrow().clone()
    }

    /// Returns a receiver that observes registration id changes.
    pub fn subscribe_id(&self) -> watch::Receiver<Option<String>> {
        self.id.subscribe()
    }

    /// Returns current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Runs the worker until `shutdown` fires, then deregisters.
    ///
    /// # Errors
    ///
    /// Returns an error only if the initial registration fails permanently.
    /// Transient store failures are retried with backoff.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<(), WorkerError> {
        let Some(worker_id) = self.register_with_retry(&mut shutdown).await? else {
            info!(name = %self.config.name, "Shutdown requested before registration");
            return Ok(());
        };
        self.id.send_replace(Some(worker_id.clone()));
        info!(
            worker_id = %worker_id,
            heartbeat_interval_secs = self.config.heartbeat_interval.as_secs(),
            "Worker started"
        );

        // The heartbeat outlives the shutdown request until the in-flight
        // job has been reported, or the monitor would reclaim it.
        let (stop_heartbeat, heartbeat_signal) = shutdown_channel();
        let heartbeat = self.spawn_heartbeat(heartbeat_signal);
        self.job_loop(&mut shutdown).await;

        stop_heartbeat.send_replace(true);
        if let Err(e) = heartbeat.await {
            error!(error = %e, "Heartbeat task panicked");
        }
        self.deregister().await;

        let stats = self.stats();
        info!(
            completed = stats.jobs_completed,
            failed = stats.jobs_failed,
            timed_out = stats.jobs_timed_out,
            ownership_lost = stats.ownership_lost,
            "Worker stopped"
        );
        Ok(())
    }

    async fn register_with_retry(
        &self,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Option<String>, WorkerError> {
        let mut backoff = Backoff::default();
        loop {
            match self.registry.register(&self.config.name).await {
                Ok(record) => return Ok(Some(record.id)),
                Err(e) if e.is_transient() => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Registration failed");
                    if sleep_or_shutdown(delay, shutdown).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn_heartbeat(&self, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let id = Arc::clone(&self.id);
        let name = self.config.name.clone();
        let interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            while !sleep_or_shutdown(interval, &mut shutdown).await {
                let Some(current) = id.borrow().clone() else {
                    continue;
                };
                match registry.heartbeat(&current, Utc::now()).await {
                    Ok(_) => {}
                    Err(WorkerError::Stale(_)) | Err(WorkerError::NotFound(_)) => {
                        warn!(worker_id = %current, "Registration lost, registering again");
                        match registry.register(&name).await {
                            Ok(record) => {
                                info!(old_id = %current, worker_id = %record.id, "Worker re-registered");
                                id.send_replace(Some(record.id));
                            }
                            Err(e) => {
                                warn!(error = %e, "Re-registration failed, retrying next interval");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(worker_id = %current, error = %e, "Heartbeat failed");
                    }
                }
            }
            debug!("Heartbeat task stopped");
        })
    }

    async fn job_loop(&self, shutdown: &mut ShutdownSignal) {
        let mut backoff = Backoff::default();

        while !*shutdown.borrow() {
            let Some(worker_id) = self.worker_id() else {
                break;
            };

            let wait = match self.repository.claim_next(&worker_id).await {
                Ok(Some(job)) => {
                    backoff.reset();
                    self.process_job(job, &worker_id, shutdown).await;
                    continue;
                }
                Ok(None) => {
                    backoff.reset();
                    debug!(worker_id = %worker_id, "No jobs available");
                    self.config.idle_backoff
                }
                Err(e) if e.is_transient() => {
                    self.recorder.record_store_error("worker");
                    let delay = backoff.next_delay();
                    warn!(
                        worker_id = %worker_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to claim job"
                    );
                    delay
                }
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "Failed to claim job");
                    self.config.idle_backoff
                }
            };

            if sleep_or_shutdown(wait, shutdown).await {
                break;
            }
        }
        info!("Worker received shutdown signal");
    }

    /// Runs one claimed job to a reported outcome.
    async fn process_job(&self, job: Job, worker_id: &str, shutdown: &ShutdownSignal) {
        let job_id = job.id;
        let request = ExtractionRequest::from_job(&job, self.config.default_job_timeout);

        info!(
            worker_id = %worker_id,
            job_id = %job_id,
            target_url = %job.target_url,
            attempt = job.retry_count + 1,
            "Processing job"
        );

        let started = self
            .report(shutdown, || self.repository.mark_running(job_id, worker_id))
            .await;
        if !self.accept_report(started, job_id, worker_id) {
            return;
        }

        let start_time = Instant::now();
        let outcome = match tokio::time::timeout(request.timeout, self.extractor.execute(&request))
            .await
        {
            Ok(Ok(result)) => Outcome::Completed(result),
            Ok(Err(e)) => Outcome::Failed(e),
            Err(_) => Outcome::Failed(ExtractionError::Timeout(request.timeout)),
        };
        let duration = start_time.elapsed();

        match outcome {
            Outcome::Completed(result) => {
                let reported = self
                    .report(shutdown, || {
                        self.repository
                            .mark_completed(job_id, worker_id, result.clone())
                    })
                    .await;
                if self.accept_report(reported, job_id, worker_id) {
                    self.stats.record_completion(duration);
                    self.recorder
                        .record_job_outcome("completed", duration.as_secs_f64());
                    info!(
                        worker_id = %worker_id,
                        job_id = %job_id,
                        duration_ms = duration.as_millis() as u64,
                        "Job completed successfully"
                    );
                }
            }
            Outcome::Failed(err) => {
                let timed_out = matches!(err, ExtractionError::Timeout(_));
                if timed_out {
                    warn!(
                        worker_id = %worker_id,
                        job_id = %job_id,
                        timeout_secs = request.timeout.as_secs(),
                        "Extraction timed out"
                    );
                } else {
                    warn!(worker_id = %worker_id, job_id = %job_id, error = %err, "Extraction failed");
                }

                let message = err.to_string();
                let reported = self
                    .report(shutdown, || {
                        self.repository.mark_failed(job_id, worker_id, &message)
                    })
                    .await;
                let outcome = reported.as_ref().ok().map(|(_, outcome)| *outcome);
                if self.accept_report(reported, job_id, worker_id) {
                    self.stats.record_failure(duration, timed_out);
                    let label = if timed_out { "timeout" } else { "failed" };
                    self.recorder.record_job_outcome(label, duration.as_secs_f64());
                    if let Some(FailureOutcome::Exhausted) = outcome {
                        error!(worker_id = %worker_id, job_id = %job_id, "Job failed permanently");
                    }
                }
            }
        }
    }

    /// Retries a job report on transient store errors.
    ///
    /// Gives up only on a non-transient error, or on a transient one once
    /// shutdown has been requested; in that case the monitor reclaims the
    /// job after the process stops heartbeating.
    async fn report<T, F, Fut>(&self, shutdown: &ShutdownSignal, mut call: F) -> Result<T, JobError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, JobError>>,
    {
        let mut backoff = Backoff::default();
        loop {
            match call().await {
                Err(e) if e.is_transient() && !*shutdown.borrow() => {
                    self.recorder.record_store_error("worker");
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Job report failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Logs a failed report. Returns whether the report went through.
    fn accept_report<T>(&self, result: Result<T, JobError>, job_id: Uuid, worker_id: &str) -> bool {
        match result {
            Ok(_) => true,
            Err(JobError::NotOwner { .. }) | Err(JobError::InvalidTransition { .. }) => {
                self.stats.record_lost();
                self.recorder.record_ownership_lost();
                warn!(
                    worker_id = %worker_id,
                    job_id = %job_id,
                    "Job was reclaimed from this worker, dropping result"
                );
                false
            }
            Err(e) => {
                error!(worker_id = %worker_id, job_id = %job_id, error = %e, "Failed to report job");
                false
            }
        }
    }

    /// Releases any jobs still listed for this worker and removes its record.
    async fn deregister(&self) {
        let Some(worker_id) = self.worker_id() else {
            return;
        };

        match self.repository.reclaim_worker_jobs(&worker_id, Utc::now()).await {
            Ok(report) if report.total_released() > 0 => {
                warn!(
                    worker_id = %worker_id,
                    requeued = report.requeued,
                    failed = report.failed,
                    "Released unfinished jobs on shutdown"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Could not release jobs, leaving them to the monitor");
                return;
            }
        }

        match self.registry.remove(&worker_id).await {
            Ok(()) => {
                self.id.send_replace(None);
                info!(worker_id = %worker_id, "Worker deregistered");
            }
            Err(e) => warn!(worker_id = %worker_id, error = %e, "Failed to deregister worker"),
        }
    }
}
