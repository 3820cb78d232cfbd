//! Command-line interface for spineforge.
//!
//! Provides commands for the full pipeline run, dataset assembly, stage
//! execution and the standalone remap / alternate-channel utilities.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
