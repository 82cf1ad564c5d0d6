//! crawlfleet: distributed extraction job queue with an auto-scaled worker fleet.
//!
//! Clients submit extraction jobs into a priority queue held in a shared
//! coordination store (Redis). Worker processes claim jobs, heartbeat while
//! they run, and report results. A coordinator process reclaims jobs from
//! workers that stop heartbeating and resizes the fleet with the backlog.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod extraction;
pub mod metrics;
pub mod scaling;
pub mod scheduler;
pub mod store;
pub mod utils;

// Re-export commonly used error types
pub use config::{ConfigError, CrawlfleetConfig};
pub use error::{ExtractionError, JobError, ScalingError, StoreError, WorkerError};
