//! Heartbeat monitor and reclaim loop.
//!
//! One monitor cycle:
//!
//! 1. Marks every active worker whose heartbeat is older than
//!    `stale_threshold` as stale.
//! 2. Reclaims the jobs listed in every stale worker's job set.
//! 3. Reconciles the jobs listed as pending, retrying, assigned or running
//!    against the registry and the queue, repairing the gaps a crash between
//!    two store writes can leave behind. Finished jobs are not read.
//! 4. Removes stale worker records older than `worker_record_ttl` once they
//!    hold no jobs.
//! 5. Deletes finished job records older than `job_record_ttl`.
//!
//! Every step is idempotent, so several monitors may run against the same
//! store and a cycle interrupted half-way is simply finished by the next one.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::job::{FailureOutcome, Job, JobStatus};
use super::registry::{WorkerRecord, WorkerRegistry, WorkerStatus};
use super::repository::{JobRepository, ReclaimReport};
use crate::error::{JobError, WorkerError};
use crate::metrics::MetricsRecorder;
use crate::utils::{sleep_or_shutdown, Backoff, ShutdownSignal};

/// Statuses whose jobs reconciliation inspects.
const UNFINISHED: [JobStatus; 4] = [
    JobStatus::Assigned,
    JobStatus::Running,
    JobStatus::Pending,
    JobStatus::Retrying,
];

/// Heartbeat monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between monitor cycles.
    #[serde(with = "crate::config::duration_secs")]
    pub check_interval: Duration,
    /// Heartbeat age after which a worker is considered lost.
    #[serde(with = "crate::config::duration_secs")]
    pub stale_threshold: Duration,
    /// How long stale worker records are kept before removal.
    #[serde(with = "crate::config::duration_secs")]
    pub worker_record_ttl: Duration,
    /// How long completed, failed and cancelled job records are kept.
    #[serde(with = "crate::config::duration_secs")]
    pub job_record_ttl: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(120),
            worker_record_ttl: Duration::from_secs(24 * 60 * 60),
            job_record_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl MonitorConfig {
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_worker_record_ttl(mut self, ttl: Duration) -> Self {
        self.worker_record_ttl = ttl;
        self
    }

    pub fn with_job_record_ttl(mut self, ttl: Duration) -> Self {
        self.job_record_ttl = ttl;
        self
    }
}

/// What a single monitor cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    pub workers_checked: usize,
    pub workers_marked_stale: usize,
    pub reclaimed: ReclaimReport,
    /// Queued-state jobs that had lost their queue entry.
    pub orphans_requeued: usize,
    pub workers_removed: usize,
    /// Finished job records deleted after their retention.
    pub jobs_pruned: usize,
    /// Per-item failures that were logged and skipped.
    pub errors: usize,
}

impl MonitorReport {
    /// Returns whether the cycle changed anything.
    pub fn is_quiet(&self) -> bool {
        self.workers_marked_stale == 0
            && self.reclaimed.total_released() == 0
            && self.orphans_requeued == 0
            && self.workers_removed == 0
            && self.jobs_pruned == 0
            && self.errors == 0
    }
}

/// Detects lost workers and returns their jobs to the queue.
pub struct HeartbeatMonitor {
    registry: WorkerRegistry,
    repository: JobRepository,
    config: MonitorConfig,
    recorder: MetricsRecorder,
}

impl HeartbeatMonitor {
    pub fn new(registry: WorkerRegistry, repository: JobRepository, config: MonitorConfig) -> Self {
        Self {
            registry,
            repository,
            config,
            recorder: MetricsRecorder::new(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Runs one monitor cycle as of `now`.
    ///
    /// # Errors
    ///
    /// Transient store errors abort the cycle so the caller can back off.
    /// Other per-worker or per-job failures are logged, counted in
    /// `MonitorReport::errors`, and skipped.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<MonitorReport, WorkerError> {
        let mut report = MonitorReport::default();
        let mut workers = self.registry.list().await?;
        report.workers_checked = workers.len();

        for worker in workers.iter_mut() {
            if !worker.is_active() || !worker.is_overdue(self.config.stale_threshold, now) {
                continue;
            }
            match self
                .registry
                .mark_stale_if_overdue(&worker.id, self.config.stale_threshold, now)
                .await
            {
                Ok(true) => {
                    report.workers_marked_stale += 1;
                    worker.status = WorkerStatus::Stale;
                }
                Ok(false) => {}
                Err(e) => self.skip_or_abort(e, &mut report, "mark worker stale")?,
            }
        }

        for worker in workers.iter().filter(|w| !w.is_active()) {
            match self.repository.reclaim_worker_jobs(&worker.id, now).await {
                Ok(reclaimed) => {
                    if reclaimed.total_released() > 0 {
                        info!(
                            worker_id = %worker.id,
                            requeued = reclaimed.requeued,
                            failed = reclaimed.failed,
                            "Reclaimed jobs from stale worker"
                        );
                    }
                    report.reclaimed.merge(reclaimed);
                }
                Err(e) => self.skip_or_abort(e.into(), &mut report, "reclaim worker jobs")?,
            }
        }

        self.reconcile(&workers, now, &mut report).await?;
        self.collect_garbage(&workers, now, &mut report).await?;

        match self
            .repository
            .prune_finished(self.config.job_record_ttl, now)
            .await
        {
            Ok(pruned) => report.jobs_pruned = pruned,
            Err(e) => self.skip_or_abort(e.into(), &mut report, "prune finished jobs")?,
        }

        self.recorder.record_reclaim(&report.reclaimed);
        Ok(report)
    }

    /// Repairs job records left inconsistent by a crash between writes.
    async fn reconcile(
        &self,
        workers: &[WorkerRecord],
        now: DateTime<Utc>,
        report: &mut MonitorReport,
    ) -> Result<(), WorkerError> {
        let by_id: HashMap<&str, &WorkerRecord> =
            workers.iter().map(|w| (w.id.as_str(), w)).collect();

        for status in UNFINISHED {
            for job in self.repository.jobs_with_status(status).await? {
                let outcome = if status.is_active() {
                    self.reconcile_active(&job, &by_id, now, report).await
                } else {
                    self.reconcile_queued(&job, now, report).await
                };
                if let Err(e) = outcome {
                    self.skip_or_abort(e.into(), report, "reconcile job")?;
                }
            }
        }
        Ok(())
    }

    async fn reconcile_active(
        &self,
        job: &Job,
        workers: &HashMap<&str, &WorkerRecord>,
        now: DateTime<Utc>,
        report: &mut MonitorReport,
    ) -> Result<(), JobError> {
        let Some(worker_id) = job.assigned_worker.as_deref() else {
            return Ok(());
        };

        let owner_lost = match workers.get(worker_id) {
            Some(worker) => !worker.is_active(),
            // Not in the listing; it may have registered after we read it.
            None => match self.registry.get(worker_id).await {
                Ok(worker) => !worker.is_active(),
                Err(WorkerError::NotFound(_)) => true,
                Err(WorkerError::Store(e)) => return Err(e.into()),
                Err(WorkerError::Job(e)) => return Err(e),
                Err(WorkerError::Stale(_)) => true,
            },
        };
        let assignment_abandoned = job.status == JobStatus::Assigned
            && elapsed(job.updated_at, now) > self.config.stale_threshold;

        if !owner_lost && !assignment_abandoned {
            return Ok(());
        }

        match self.repository.reclaim_job(job.id, worker_id, now).await? {
            Some(outcome) => {
                warn!(
                    job_id = %job.id,
                    worker_id = %worker_id,
                    owner_lost = owner_lost,
                    "Reclaimed job with lost assignment"
                );
                match outcome {
                    FailureOutcome::Requeued { .. } => report.reclaimed.requeued += 1,
                    FailureOutcome::Exhausted => report.reclaimed.failed += 1,
                }
            }
            None => report.reclaimed.skipped += 1,
        }
        Ok(())
    }

    async fn reconcile_queued(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        report: &mut MonitorReport,
    ) -> Result<(), JobError> {
        if elapsed(job.updated_at, now) <= self.config.stale_threshold {
            return Ok(());
        }
        if self.repository.queue().contains(job.id).await? {
            return Ok(());
        }
        if self.repository.requeue_orphan(job.id, now).await? {
            warn!(job_id = %job.id, status = %job.status, "Re-queued job missing from queue");
            report.orphans_requeued += 1;
        }
        Ok(())
    }

    async fn collect_garbage(
        &self,
        workers: &[WorkerRecord],
        now: DateTime<Utc>,
        report: &mut MonitorReport,
    ) -> Result<(), WorkerError> {
        for worker in workers {
            if worker.is_active() || !worker.is_overdue(self.config.worker_record_ttl, now) {
                continue;
            }
            let removal = async {
                if !self.repository.active_job_ids(&worker.id).await?.is_empty() {
                    return Ok(false);
                }
                self.registry.remove(&worker.id).await?;
                Ok::<bool, WorkerError>(true)
            };
            match removal.await {
                Ok(true) => report.workers_removed += 1,
                Ok(false) => debug!(worker_id = %worker.id, "Stale worker still lists jobs"),
                Err(e) => self.skip_or_abort(e, report, "remove stale worker")?,
            }
        }
        Ok(())
    }

    fn skip_or_abort(
        &self,
        err: WorkerError,
        report: &mut MonitorReport,
        step: &str,
    ) -> Result<(), WorkerError> {
        if err.is_transient() {
            return Err(err);
        }
        error!(step = step, error = %err, "Monitor step failed, skipping");
        report.errors += 1;
        Ok(())
    }

    /// Runs monitor cycles until shutdown.
    ///
    /// Transient failures are retried with exponential backoff instead of
    /// waiting a full interval.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Heartbeat monitor started"
        );
        let mut backoff = Backoff::default();

        loop {
            let wait = match self.run_cycle(Utc::now()).await {
                Ok(report) => {
                    backoff.reset();
                    if report.is_quiet() {
                        debug!(workers = report.workers_checked, "Monitor cycle complete");
                    } else {
                        info!(
                            workers = report.workers_checked,
                            marked_stale = report.workers_marked_stale,
                            requeued = report.reclaimed.requeued,
                            failed = report.reclaimed.failed,
                            orphans = report.orphans_requeued,
                            removed = report.workers_removed,
                            pruned = report.jobs_pruned,
                            errors = report.errors,
                            "Monitor cycle complete"
                        );
                    }
                    self.config.check_interval
                }
                Err(e) if e.is_transient() => {
                    self.recorder.record_store_error("monitor");
                    let delay = backoff.next_delay().min(self.config.check_interval);
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Monitor cycle aborted");
                    delay
                }
                Err(e) => {
                    error!(error = %e, "Monitor cycle failed");
                    self.config.check_interval
                }
            };

            if sleep_or_shutdown(wait, &mut shutdown).await {
                break;
            }
        }

        info!("Heartbeat monitor stopped");
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
