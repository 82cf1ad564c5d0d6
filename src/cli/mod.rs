//! Command-line interface for crawlfleet.
//!
//! Provides commands for submitting and inspecting jobs and for running
//! workers and the coordinator loops.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
