//! Periodic queue and fleet snapshots.
//!
//! `MetricsCollector` reads job, queue and worker counts from the
//! coordination store, keeps a rolling window of the most recent snapshots
//! in memory, mirrors each one into the Prometheus gauges and hands it to
//! an optional `MetricsSink`. The auto-scaler takes its inputs from these
//! snapshots.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::collectors::MetricsRecorder;
use crate::error::WorkerError;
use crate::scheduler::{JobCounts, JobRepository, WorkerRegistry};
use crate::utils::{sleep_or_shutdown, Backoff, ShutdownSignal};

/// Number of snapshots kept for trend calculations.
pub const DEFAULT_WINDOW_SIZE: usize = 60;

/// Point-in-time view of the queue and the worker fleet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Job records by status.
    pub jobs: JobCounts,
    /// Jobs waiting for a worker (`pending` plus `retrying`).
    pub pending_jobs: usize,
    /// Entries in the priority queue.
    pub queue_depth: usize,
    pub active_workers: usize,
    pub total_workers: usize,
}

impl MetricsSnapshot {
    /// Pending jobs per active worker; with no active workers this is the
    /// pending count itself.
    pub fn jobs_per_worker(&self) -> f64 {
        if self.active_workers == 0 {
            return self.pending_jobs as f64;
        }
        self.pending_jobs as f64 / self.active_workers as f64
    }

    pub fn total_jobs(&self) -> usize {
        self.jobs.total
    }

    pub fn running_jobs(&self) -> usize {
        self.jobs.assigned + self.jobs.running
    }
}

/// Rates derived from the oldest and newest snapshot in the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsTrend {
    /// Time between the two snapshots.
    pub span: Duration,
    /// Change in pending jobs per minute (positive means the backlog grows).
    pub pending_change_per_minute: f64,
    /// Jobs completed per minute.
    pub completed_per_minute: f64,
    /// Jobs failed terminally per minute.
    pub failed_per_minute: f64,
}

impl MetricsTrend {
    /// Computes the trend between two snapshots, or `None` if they are not
    /// strictly ordered in time.
    pub fn between(oldest: &MetricsSnapshot, newest: &MetricsSnapshot) -> Option<Self> {
        let span = (newest.timestamp - oldest.timestamp).to_std().ok()?;
        if span.is_zero() {
            return None;
        }
        let minutes = span.as_secs_f64() / 60.0;
        let rate = |from: usize, to: usize| (to as f64 - from as f64) / minutes;

        Some(Self {
            span,
            pending_change_per_minute: rate(oldest.pending_jobs, newest.pending_jobs),
            completed_per_minute: rate(oldest.jobs.completed, newest.jobs.completed),
            failed_per_minute: rate(oldest.jobs.failed, newest.jobs.failed),
        })
    }
}

/// Receives every collected snapshot. Implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn export(&self, snapshot: &MetricsSnapshot);
}

/// Sink that logs each snapshot through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn export(&self, snapshot: &MetricsSnapshot) {
        info!(
            pending = snapshot.pending_jobs,
            queue_depth = snapshot.queue_depth,
            running = snapshot.running_jobs(),
            completed = snapshot.jobs.completed,
            failed = snapshot.jobs.failed,
            active_workers = snapshot.active_workers,
            total_workers = snapshot.total_workers,
            jobs_per_worker = snapshot.jobs_per_worker(),
            "Metrics snapshot"
        );
    }
}

/// Collects snapshots and keeps a rolling window of them.
pub struct MetricsCollector {
    repository: JobRepository,
    registry: WorkerRegistry,
    window: RwLock<VecDeque<MetricsSnapshot>>,
    window_size: usize,
    sink: Option<Arc<dyn MetricsSink>>,
    recorder: MetricsRecorder,
}

impl MetricsCollector {
    pub fn new(repository: JobRepository, registry: WorkerRegistry) -> Self {
        Self {
            repository,
            registry,
            window: RwLock::new(VecDeque::with_capacity(DEFAULT_WINDOW_SIZE)),
            window_size: DEFAULT_WINDOW_SIZE,
            sink: None,
            recorder: MetricsRecorder::new(),
        }
    }

    /// Sets the number of snapshots kept (at least one).
    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size.max(1);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Reads the store and records a new snapshot.
    pub async fn collect(&self) -> Result<MetricsSnapshot, WorkerError> {
        let jobs = self.repository.status_counts().await?;
        let queue_depth = self.repository.queue().len().await?;
        let workers = self.registry.counts().await?;

        let snapshot = MetricsSnapshot {
            timestamp: Utc::now(),
            jobs,
            pending_jobs: jobs.waiting(),
            queue_depth,
            active_workers: workers.active,
            total_workers: workers.total,
        };
        self.push(snapshot.clone());

        self.recorder.record_snapshot(&snapshot);
        if let Some(sink) = &self.sink {
            sink.export(&snapshot);
        }
        Ok(snapshot)
    }

    /// Adds a snapshot to the window, evicting the oldest when full.
    pub fn push(&self, snapshot: MetricsSnapshot) {
        let mut window = self.window.write().unwrap_or_else(PoisonError::into_inner);
        while window.len() >= self.window_size {
            window.pop_front();
        }
        window.push_back(snapshot);
    }

    /// Most recent snapshot.
    pub fn latest(&self) -> Option<MetricsSnapshot> {
        let window = self.window.read().unwrap_or_else(PoisonError::into_inner);
        window.back().cloned()
    }

    /// Snapshots in the window, oldest first.
    pub fn history(&self) -> Vec<MetricsSnapshot> {
        let window = self.window.read().unwrap_or_else(PoisonError::into_inner);
        window.iter().cloned().collect()
    }

    /// Trend across the whole window; `None` with fewer than two snapshots.
    pub fn trend(&self) -> Option<MetricsTrend> {
        let window = self.window.read().unwrap_or_else(PoisonError::into_inner);
        MetricsTrend::between(window.front()?, window.back()?)
    }

    /// Collects a snapshot every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: ShutdownSignal) {
        let mut backoff = Backoff::default();
        loop {
            let wait = match self.collect().await {
                Ok(_) => {
                    backoff.reset();
                    interval
                }
                Err(e) => {
                    if e.is_transient() {
                        self.recorder.record_store_error("metrics");
                    }
                    let delay = backoff.next_delay().min(interval);
                    warn!(error = %e, "Metrics collection failed");
                    delay
                }
            };
            if sleep_or_shutdown(wait, &mut shutdown).await {
                break;
            }
        }
    }
}
