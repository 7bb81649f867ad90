//! Pathology Detector
//!
//! Captures voice samples into WAV files and submits them to a remote
//! pathology classifier, tracking each recording's analysis status.
//!
//! The pieces, leaves first:
//! - [`audio`]: microphone capture, container writing, recording sessions
//! - [`analysis`]: classifier client and retrying analysis jobs
//! - [`store`]: saved recordings and their durable outcomes
//! - [`playback`]: player contract used for previewing takes
//! - [`coordinator`]: single task that merges all of the above into a [`ViewState`]

pub mod analysis;
pub mod audio;
pub mod cli;
pub mod coordinator;
pub mod playback;
pub mod settings;
pub mod state_machine;
pub mod store;
pub mod view;

pub use coordinator::{spawn, CoordinatorConfig, CoordinatorError, CoordinatorHandle};
pub use settings::Settings;
pub use view::{RecordView, RecorderView, ViewState};

use clap::Parser;

/// Parse the command line and run the requested subcommand.
pub fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    cli::run_cli(cli)
}
