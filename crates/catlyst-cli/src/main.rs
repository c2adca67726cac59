//! `catlyst` - pull incidents with their enrichment and export them as JSON.

#![forbid(unsafe_code)]

mod cli;
mod export;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use catlyst_ingest::{FetchWindow, IngestConfig, Orchestrator, ShutdownSignal};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::cli::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = init_tracing(args.log_level.as_deref(), args.log_json) {
        eprintln!("catlyst: {err:#}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "ingestion failed");
            eprintln!("catlyst: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: Option<&str>, json: bool) -> Result<()> {
    let filter = match level {
        Some(directive) => EnvFilter::try_new(directive)
            .with_context(|| format!("invalid log level {directive:?}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!json).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .context("installing tracing subscriber")
}

async fn run(args: Args) -> Result<()> {
    let config = IngestConfig::load(args.config.as_deref())?.with_process_env()?;
    let config = args.apply(config);
    config.validate()?;
    let config = Arc::new(config);

    let until = args.until.unwrap_or_else(Utc::now);
    let window = FetchWindow::lookback(config.lookback.default_days, until, config.verdicts.clone())?;
    window.validate_listing(&config.lookback.limits())?;

    let shutdown = ShutdownSignal::new();
    spawn_ctrl_c(shutdown.clone());

    let orchestrator = Orchestrator::from_config(Arc::clone(&config))?.with_shutdown(shutdown);
    let output = orchestrator.run(&window).await?;

    export::write_export(&args.output, &output, args.flatten)?;
    info!(
        path = %args.output.display(),
        threats = output.records.len(),
        partial = output.summary.partial,
        failed = output.summary.failed,
        cancelled = output.summary.cancelled,
        "export written"
    );
    Ok(())
}

fn spawn_ctrl_c(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight incidents");
            shutdown.trigger();
        }
    });
}
