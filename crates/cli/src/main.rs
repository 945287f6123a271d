mod cli;
mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use factorflow_core::{load_dotenv, FlowConfig, Parameters};
use factorflow_scheduler::{build_pipeline, PipelineOutcome, ProcessContext};
use factorflow_state::StateStore;

use crate::cli::{CliArgs, Command};

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    match args.command {
        Command::Run {
            config,
            workers,
            database,
        } => {
            let outcome = run(&config, workers, database).await?;
            if !outcome.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Status { config, database } => {
            let (cfg, _) = load(&config, database)?;
            let store = StateStore::open(cfg.database_path())
                .with_context(|| format!("failed to open state file {}", cfg.database_path().display()))?;
            status::print(&cfg, &store)
        }
    }
}

/// Read the job file as both config and task parameters.
fn load(path: &Path, database: Option<PathBuf>) -> Result<(FlowConfig, Parameters)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut cfg = FlowConfig::from_toml(&text)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    if database.is_some() {
        cfg.database = database;
    }
    let params = Parameters::from_toml(&text).context("failed to read task parameters")?;
    Ok((cfg, params))
}

async fn run(path: &Path, workers: Option<usize>, database: Option<PathBuf>) -> Result<PipelineOutcome> {
    let (mut cfg, params) = load(path, database)?;
    if let Some(n) = workers {
        cfg.workers.threads = n;
    }
    let store = StateStore::open(cfg.database_path())
        .with_context(|| format!("failed to open state file {}", cfg.database_path().display()))?;

    let ctx = ProcessContext::new();

    let signal_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            signal_ctx.interrupt();
        }
    });

    info!(job = %cfg.name, config = %path.display(), "Starting");
    let params = Arc::new(params);
    let outcome = tokio::task::spawn_blocking(move || -> Result<PipelineOutcome> {
        let mut pipeline = build_pipeline(&cfg, params, store, ctx).context("failed to build pipeline")?;
        Ok(pipeline.run()?)
    })
    .await
    .context("pipeline thread panicked")??;

    Ok(outcome)
}
