mod cli;
mod stages;

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sqlflow_core::{load_dotenv, load_json_dataset, RunConfig};
use sqlflow_engine::{Engine, RunSummary};
use tracing::{info, warn};

use crate::cli::{CliArgs, Command, RunArgs};

fn main() -> Result<()> {
    load_dotenv();

    // stdout belongs to the worker protocol; all logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    match args.command {
        Command::Run(run) => run_dataset(run),
        Command::Worker { config } => serve_worker(&config),
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: &Path) -> Result<RunConfig> {
    RunConfig::from_file(path).with_context(|| format!("failed to load config {}", path.display()))
}

fn build_engine(config: RunConfig) -> Result<Engine> {
    let builder = stages::register(Engine::builder(config.clone()), &config);
    builder.build().context("failed to assemble engine")
}

fn run_dataset(args: RunArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    if let Some(strategy) = args.strategy {
        config.run.strategy = strategy;
    }
    if let Some(workers) = args.workers {
        config.run.workers = workers;
    }
    if let Some(dir) = args.output_dir {
        config.run.output_dir = dir;
    }
    config.validate().context("invalid config after command-line overrides")?;

    let tasks = load_json_dataset(&args.dataset, config.run.start, config.run.end)
        .with_context(|| format!("failed to load dataset {}", args.dataset.display()))?;
    let threshold = config.run.failure_threshold;
    let output_dir = config.run.output_dir.clone();

    let engine = build_engine(config)?;
    let engine_cancel = engine.cancel_signal();
    on_ctrl_c(move || {
        warn!("interrupt received, finishing in-flight stages");
        engine_cancel.cancel();
    });

    let summary = engine.run(tasks)?;
    print_summary(&summary, &output_dir);

    let rate = summary.failure_rate();
    if rate > threshold {
        bail!(
            "failure rate {:.1}% exceeds threshold {:.1}%",
            rate * 100.0,
            threshold * 100.0
        );
    }
    Ok(())
}

fn serve_worker(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let engine = build_engine(config)?;
    // The coordinator forwards interrupts over the protocol; a terminal
    // Ctrl-C reaching the whole process group must not kill us mid-stage.
    on_ctrl_c(|| info!("worker ignoring interrupt, waiting for coordinator"));
    engine.serve_worker().context("worker failed")
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let engine = build_engine(config)?;
    let config = engine.config();

    println!("config ok: {}", path.display());
    println!("  strategy: {}", config.run.strategy().name());
    for (i, stage) in config.stages.iter().enumerate() {
        let pool = stage.resource.as_deref().unwrap_or("-");
        println!(
            "  stage {i}: {} (pool: {pool}, cacheable: {}, checkpointed: {})",
            stage.name, stage.cacheable, stage.skippable_if_checkpointed
        );
    }
    for pool in engine.pool_stats() {
        println!("  pool {}: size {}", pool.name, pool.size);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, output_dir: &Path) {
    let s = &summary.results.summary;
    println!(
        "{} tasks in {:.1}s ({}): {} succeeded, {} failed, {} missing{}",
        s.total,
        summary.elapsed.as_secs_f64(),
        summary.strategy,
        s.succeeded,
        s.failed,
        s.missing,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    println!("results written to {}", output_dir.display());
}

/// Run `handler` on the first Ctrl-C, from a dedicated thread.
fn on_ctrl_c(handler: impl FnOnce() + Send + 'static) {
    let spawned = std::thread::Builder::new()
        .name("sqlflow-signal".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_io().build() {
                Ok(rt) => rt,
                Err(e) => {
                    warn!(error = %e, "interrupt handling disabled");
                    return;
                }
            };
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                handler();
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "interrupt handling disabled");
    }
}
