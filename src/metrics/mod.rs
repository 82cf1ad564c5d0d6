//! Metrics collection and Prometheus export.
//!
//! - `MetricsCollector` takes periodic snapshots of the queue and fleet,
//!   keeps a rolling window for trend calculations, and feeds the
//!   auto-scaler.
//! - `MetricsRecorder` records individual events (job outcomes, reclaims,
//!   scaling decisions) into the Prometheus registry.
//!
//! # Example
//!
//! ```ignore
//! use crawlfleet::metrics::{export_metrics, init_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new(repository, registry);
//! let snapshot = collector.collect().await?;
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;
pub mod snapshot;

pub use collectors::MetricsRecorder;
pub use prometheus::{export_metrics, init_metrics, REGISTRY};
pub use snapshot::{
    LogSink, MetricsCollector, MetricsSink, MetricsSnapshot, MetricsTrend, DEFAULT_WINDOW_SIZE,
};
