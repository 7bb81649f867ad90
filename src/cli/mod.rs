//! Command-line front end.

mod args;
mod commands;

pub use args::{AnalyzeArgs, Cli, Commands, ConfigArgs, RecordArgs};
pub use commands::run_cli;
