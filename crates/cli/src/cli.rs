use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sqlflow_core::StrategyKind;

/// Run a dataset through a staged text-to-SQL pipeline.
#[derive(Parser, Debug)]
#[command(name = "sqlflow", version, about = "Staged task orchestration for text-to-SQL datasets")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every task of a dataset and write ordered results.
    Run(RunArgs),

    /// Serve tasks from a coordinator over stdin/stdout (process strategy).
    Worker {
        /// Path to the run config the coordinator was started with
        #[arg(long, env = "SQLFLOW_CONFIG")]
        config: PathBuf,
    },

    /// Validate a config and bind its stages without running anything.
    CheckConfig {
        #[arg(long, env = "SQLFLOW_CONFIG")]
        config: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Path to the run config (TOML)
    #[arg(long, env = "SQLFLOW_CONFIG")]
    pub config: PathBuf,

    /// JSON array of dataset entries
    #[arg(long)]
    pub dataset: PathBuf,

    /// Override `run.strategy`: sequential, thread, process or async
    #[arg(long)]
    pub strategy: Option<StrategyKind>,

    /// Override `run.workers`
    #[arg(long)]
    pub workers: Option<usize>,

    /// Override `run.output_dir`
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}
