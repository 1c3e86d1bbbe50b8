//! Command-line interface for fragment-relay.
//!
//! Provides commands to run the worker pool, submit jobs, tail fragment
//! logs, inspect the queue and run an in-process demo.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
