//! Distributed job queue, worker registry and worker runtime.
//!
//! Every process coordinates only through the `CoordinationStore`:
//!
//! ```text
//!   client ──submit──▶ JobRepository ──push──▶ PriorityQueue
//!                                                   │ pop
//!   Worker ◀──────────── claim_next ────────────────┘
//!     │ heartbeat                 │ mark_running / mark_completed / mark_failed
//!     ▼                           ▼
//!   WorkerRegistry           job records
//!     ▲
//!     └── HeartbeatMonitor: mark stale, reclaim, reconcile
//! ```
//!
//! # Guarantees
//!
//! - **At most one owner**: a job is assigned by a compare-and-swap from a
//!   queued state, and only the owning worker may move it further.
//! - **No silent loss**: a job is always queued, owned by a worker, or
//!   terminal. Jobs of lost workers are reclaimed by the monitor.
//! - **Ordering**: higher priority first, FIFO within a priority.
//! - **Single retry policy**: `Job::fail` / `Job::reclaim` decide between
//!   re-queue and terminal failure.

pub mod job;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod repository;
pub mod service;
pub mod worker;

pub use job::{CancelOutcome, FailureOutcome, Job, JobStatus, SubmitRequest};
pub use monitor::{HeartbeatMonitor, MonitorConfig, MonitorReport};
pub use queue::{PriorityQueue, QueueEntry};
pub use registry::{WorkerCounts, WorkerRecord, WorkerRegistry, WorkerStatus};
pub use repository::{JobCounts, JobRepository, ReclaimReport};
pub use service::{JobService, QueueStats};
pub use worker::{Worker, WorkerConfig, WorkerStats};
