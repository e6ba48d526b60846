//! Command-line interface for stacforge.
//!
//! Provides commands for serving the HTTP trigger surface, running a
//! single transformation, and validating templates offline.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
