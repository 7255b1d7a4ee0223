use super::commands;
use clap::{ArgAction, Parser, Subcommand};
use cryofold_model::Preset;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// More log output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Silence all log output.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Predict a structure from a feature batch.
    Predict {
        /// Feature batch (safetensors).
        #[arg(short, long)]
        features: PathBuf,
        /// Model weights (safetensors).
        #[arg(short, long, conflicts_with = "seed")]
        weights: Option<PathBuf>,
        /// Initialise weights from this seed instead of loading them.
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, default_value = "cryofold-v1")]
        preset: Preset,
        /// JSON configuration; replaces the preset.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Output tensors (safetensors).
        #[arg(short, long)]
        output: PathBuf,
        /// Run on the CPU even when an accelerator is available.
        #[arg(long)]
        cpu: bool,
    },
    /// Validate a configuration and print it with every default filled in.
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

impl Cli {
    pub fn execute(self) -> anyhow::Result<()> {
        match self.command {
            Commands::Predict {
                features,
                weights,
                seed,
                preset,
                config,
                output,
                cpu,
            } => commands::predict::execute(commands::predict::PredictArgs {
                features,
                weights,
                seed,
                preset,
                config,
                output,
                cpu,
            }),
            Commands::CheckConfig { config } => commands::check_config::execute(config),
        }
    }
}
