//! CLI argument definitions using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::analysis::AnalysisModel;

/// Pathology Detector - record voice samples and analyze them remotely
#[derive(Parser)]
#[command(name = "pathology-detector")]
#[command(about = "Record voice samples and submit them to a pathology classifier", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Classifier server URL (overrides settings and PATHOLOGY_DETECTOR_SERVER)
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Record store file (default: ~/.local/share/pathology-detector/records.json)
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record a voice sample from the default microphone and save it
    Record(RecordArgs),
    /// List saved recordings and their analysis status
    List,
    /// Submit a recording for analysis and wait for the result
    Analyze(AnalyzeArgs),
    /// Delete a recording and its audio file
    Delete {
        /// Record id (see `list`)
        id: i64,
    },
    /// Print the effective settings and file locations, or change them
    Config(ConfigArgs),
}

#[derive(Parser)]
pub struct ConfigArgs {
    /// Persist a setting, e.g. `--set server_url=http://10.0.2.2:5000` (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,
}

#[derive(Parser)]
pub struct RecordArgs {
    /// How long to record
    #[arg(short, long, default_value_t = 5)]
    pub seconds: u64,

    /// Name to save the recording under (default: "Voice <timestamp>")
    #[arg(short, long)]
    pub name: Option<String>,
}

#[derive(Parser)]
pub struct AnalyzeArgs {
    /// Record id (see `list`)
    pub id: i64,

    /// Classifier model: model1, model2 or model3 (default from settings)
    #[arg(short, long)]
    pub model: Option<AnalysisModel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_accepts_repeated_set() {
        let cli = Cli::try_parse_from([
            "pathology-detector",
            "config",
            "--set",
            "sample_rate=16000",
            "--set",
            "default_model=model2",
        ])
        .unwrap();

        match cli.command {
            Commands::Config(args) => {
                assert_eq!(args.set, vec!["sample_rate=16000", "default_model=model2"])
            }
            _ => panic!("expected config command"),
        }
    }

    #[test]
    fn plain_config_sets_nothing() {
        let cli = Cli::try_parse_from(["pathology-detector", "config"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(args) if args.set.is_empty()));
    }
}
