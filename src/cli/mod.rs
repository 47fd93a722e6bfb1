//! Command-line interface for dataset-kurator.
//!
//! Provides commands to queue videos, run a batch, and inspect the process
//! log and packaged results.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
