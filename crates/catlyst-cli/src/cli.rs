//! Command-line arguments and their overrides on top of file/env config.

use std::path::PathBuf;

use catlyst_ingest::IngestConfig;
use chrono::{DateTime, Utc};
use clap::Parser;

/// Pull incidents and their enrichment from the management console.
#[derive(Debug, Parser)]
#[command(name = "catlyst", version, about)]
pub struct Args {
    /// TOML configuration file. `S1_*` environment variables override it.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Lookback in days, ending at `--until`.
    #[arg(long)]
    pub since_days: Option<u32>,

    /// End of the window (RFC 3339). Defaults to now.
    #[arg(long)]
    pub until: Option<DateTime<Utc>>,

    /// Maximum concurrent enrichment workers.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Comma-separated analyst verdicts to list.
    #[arg(long, value_delimiter = ',')]
    pub verdicts: Option<Vec<String>>,

    /// Where to write the JSON export.
    #[arg(long, short = 'o', default_value = "output/threats.json")]
    pub output: PathBuf,

    /// Tracing filter directive, e.g. `info` or `catlyst_ingest=debug`.
    /// Falls back to `RUST_LOG`.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    /// Skip TLS certificate verification.
    #[arg(long)]
    pub insecure: bool,

    /// Export threats flattened to `parent_child` keys.
    #[arg(long)]
    pub flatten: bool,
}

impl Args {
    /// Apply flag overrides, the last and highest-precedence config source.
    #[must_use]
    pub fn apply(&self, mut config: IngestConfig) -> IngestConfig {
        if let Some(workers) = self.workers {
            config.workers.max_workers = workers;
        }
        if let Some(verdicts) = &self.verdicts {
            config.verdicts.clone_from(verdicts);
        }
        if let Some(days) = self.since_days {
            config.lookback.default_days = days;
        }
        if self.insecure {
            config.api.verify_ssl = false;
        }
        config
    }
}
