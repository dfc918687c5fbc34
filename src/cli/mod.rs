//! Command-line interface for stackconverge.
//!
//! Argument parsing with `clap`, text and JSON rendering of results.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::{MessageLevel, OutputFormatter};
