//! Shared utilities: retry backoff and shutdown-aware sleeping.

pub mod backoff;
pub mod shutdown;

pub use backoff::Backoff;
pub use shutdown::{shutdown_channel, sleep_or_shutdown, ShutdownSignal};
