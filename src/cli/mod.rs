//! Command-line interface for ruleforge.
//!
//! Provides commands for rule generation and checking, local pipeline runs,
//! and metrics export.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
