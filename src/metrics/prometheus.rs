//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by crawlfleet and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all crawlfleet metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Number of job ids in the priority queue.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of job records, labeled by status.
pub static JOBS: OnceLock<GaugeVec> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Number of registered workers (active and stale).
pub static TOTAL_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Pending jobs divided by active workers.
pub static JOBS_PER_WORKER: OnceLock<Gauge> = OnceLock::new();

/// Job attempts finished by workers, labeled by outcome.
pub static JOB_OUTCOMES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Extraction duration in seconds.
pub static JOB_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Results dropped because the job had been reclaimed.
pub static OWNERSHIP_LOST_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Jobs reclaimed from lost workers, labeled by outcome (requeued/failed).
pub static RECLAIMED_JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Auto-scaler decisions, labeled by action.
pub static SCALING_DECISIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Worker count most recently requested from the fleet manager.
pub static TARGET_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Transient coordination store errors, labeled by component.
pub static STORE_ERRORS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Recording
/// before initialization is a silent no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Queue and job metrics
    let queue_depth = Gauge::new(
        "crawlfleet_queue_depth",
        "Number of job ids in the priority queue",
    )?;

    let jobs = GaugeVec::new(
        Opts::new("crawlfleet_jobs", "Number of job records by status"),
        &["status"],
    )?;

    let job_outcomes_total = CounterVec::new(
        Opts::new(
            "crawlfleet_job_outcomes_total",
            "Job attempts finished by workers",
        ),
        &["outcome"],
    )?;

    let job_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "crawlfleet_job_duration_seconds",
            "Extraction duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
    )?;

    let ownership_lost_total = IntCounter::new(
        "crawlfleet_ownership_lost_total",
        "Results dropped because the job had been reclaimed",
    )?;

    // Worker metrics
    let active_workers = Gauge::new("crawlfleet_active_workers", "Number of active workers")?;
    let total_workers = Gauge::new(
        "crawlfleet_total_workers",
        "Number of registered workers, active and stale",
    )?;
    let jobs_per_worker = Gauge::new(
        "crawlfleet_jobs_per_worker",
        "Pending jobs divided by active workers",
    )?;

    let reclaimed_jobs_total = CounterVec::new(
        Opts::new(
            "crawlfleet_reclaimed_jobs_total",
            "Jobs reclaimed from lost workers",
        ),
        &["outcome"],
    )?;

    // Scaling metrics
    let scaling_decisions_total = CounterVec::new(
        Opts::new(
            "crawlfleet_scaling_decisions_total",
            "Auto-scaler decisions by action",
        ),
        &["action"],
    )?;
    let target_workers = Gauge::new(
        "crawlfleet_target_workers",
        "Worker count most recently requested from the fleet manager",
    )?;

    let store_errors_total = CounterVec::new(
        Opts::new(
            "crawlfleet_store_errors_total",
            "Transient coordination store errors",
        ),
        &["component"],
    )?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs.clone()))?;
    registry.register(Box::new(job_outcomes_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(ownership_lost_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(total_workers.clone()))?;
    registry.register(Box::new(jobs_per_worker.clone()))?;
    registry.register(Box::new(reclaimed_jobs_total.clone()))?;
    registry.register(Box::new(scaling_decisions_total.clone()))?;
    registry.register(Box::new(target_workers.clone()))?;
    registry.register(Box::new(store_errors_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS.set(jobs);
    let _ = JOB_OUTCOMES_TOTAL.set(job_outcomes_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = OWNERSHIP_LOST_TOTAL.set(ownership_lost_total);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = TOTAL_WORKERS.set(total_workers);
    let _ = JOBS_PER_WORKER.set(jobs_per_worker);
    let _ = RECLAIMED_JOBS_TOTAL.set(reclaimed_jobs_total);
    let _ = SCALING_DECISIONS_TOTAL.set(scaling_decisions_total);
    let _ = TARGET_WORKERS.set(target_workers);
    let _ = STORE_ERRORS_TOTAL.set(store_errors_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// text is a single comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
