use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Task scheduler for a distributed factoring pipeline.
///
/// Runs the configured tasks in order, hands sieving work to local worker
/// threads, and keeps all progress in a state file so that an interrupted
/// job continues where it stopped.
#[derive(Parser, Debug)]
#[command(name = "factorflow", about = "Task scheduler for a distributed factoring pipeline")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the pipeline until it completes, fails, or is interrupted
    Run {
        /// Job configuration (TOML)
        #[arg(long, env = "FACTORFLOW_CONFIG")]
        config: PathBuf,

        /// Number of local worker threads (overrides the config)
        #[arg(long)]
        workers: Option<usize>,

        /// State file path (overrides the config)
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Print the per-task counters recorded in the state file
    Status {
        /// Job configuration (TOML)
        #[arg(long, env = "FACTORFLOW_CONFIG")]
        config: PathBuf,

        /// State file path (overrides the config)
        #[arg(long)]
        database: Option<PathBuf>,
    },
}
