//! Recording helpers over the raw Prometheus metrics.
//!
//! `MetricsRecorder` keeps label values consistent across the crate and
//! turns "metrics not initialized" into a no-op, so library code and tests
//! can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, JOBS, JOBS_PER_WORKER, JOB_DURATION, JOB_OUTCOMES_TOTAL, OWNERSHIP_LOST_TOTAL,
    QUEUE_DEPTH, RECLAIMED_JOBS_TOTAL, SCALING_DECISIONS_TOTAL, STORE_ERRORS_TOTAL,
    TARGET_WORKERS, TOTAL_WORKERS,
};
use super::snapshot::MetricsSnapshot;
use crate::scheduler::{JobStatus, ReclaimReport};

/// Records crawlfleet operational metrics.
///
/// # Example
///
/// ```ignore
/// use crawlfleet::metrics::{init_metrics, MetricsRecorder};
///
/// init_metrics().expect("Failed to init metrics");
/// let recorder = MetricsRecorder::new();
/// recorder.record_job_outcome("completed", 2.5);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Records a finished job attempt.
    ///
    /// `outcome` is one of `completed`, `failed` or `timeout`.
    pub fn record_job_outcome(&self, outcome: &str, duration_secs: f64) {
        if let Some(outcomes) = JOB_OUTCOMES_TOTAL.get() {
            outcomes.with_label_values(&[outcome]).inc();
        }
        if let Some(duration) = JOB_DURATION.get() {
            duration.observe(duration_secs);
        }

        tracing::trace!(
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    /// Records a result dropped because the job had been reclaimed.
    pub fn record_ownership_lost(&self) {
        if let Some(lost) = OWNERSHIP_LOST_TOTAL.get() {
            lost.inc();
        }
    }

    /// Records jobs released by the heartbeat monitor.
    pub fn record_reclaim(&self, report: &ReclaimReport) {
        if report.total_released() == 0 {
            return;
        }
        if let Some(reclaimed) = RECLAIMED_JOBS_TOTAL.get() {
            reclaimed
                .with_label_values(&["requeued"])
                .inc_by(report.requeued as f64);
            reclaimed
                .with_label_values(&["failed"])
                .inc_by(report.failed as f64);
        }
    }

    /// Records an auto-scaler decision; `target` is set for scaling actions.
    pub fn record_scaling_decision(&self, action: &str, target: Option<usize>) {
        if let Some(decisions) = SCALING_DECISIONS_TOTAL.get() {
            decisions.with_label_values(&[action]).inc();
        }
        if let (Some(gauge), Some(target)) = (TARGET_WORKERS.get(), target) {
            gauge.set(target as f64);
        }
    }

    /// Records a transient store error seen by `component`.
    pub fn record_store_error(&self, component: &str) {
        if let Some(errors) = STORE_ERRORS_TOTAL.get() {
            errors.with_label_values(&[component]).inc();
        }
    }

    /// Mirrors a collected snapshot into the gauges.
    pub fn record_snapshot(&self, snapshot: &MetricsSnapshot) {
        if let Some(depth) = QUEUE_DEPTH.get() {
            depth.set(snapshot.queue_depth as f64);
        }
        if let Some(jobs) = JOBS.get() {
            for status in JobStatus::ALL {
                jobs.with_label_values(&[status.as_str()])
                    .set(snapshot.jobs.get(status) as f64);
            }
        }
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.set(snapshot.active_workers as f64);
        }
        if let Some(total) = TOTAL_WORKERS.get() {
            total.set(snapshot.total_workers as f64);
        }
        if let Some(ratio) = JOBS_PER_WORKER.get() {
            ratio.set(snapshot.jobs_per_worker());
        }
    }
}
