//! Catlyst incident ingestion engine.
//!
//! Lists security incidents from a SentinelOne-style management API over a
//! lookback window, enriches each with its deep-visibility events, analyst
//! notes and indicators through a bounded worker pool, and produces one
//! whitelisted [`MergedRecord`] per incident in listing order.
//!
//! ```ignore
//! use std::sync::Arc;
//! use catlyst_ingest::{FetchWindow, IngestConfig, Orchestrator};
//!
//! let config = Arc::new(IngestConfig::load(None)?.with_process_env()?);
//! config.validate()?;
//! let window = FetchWindow::lookback(config.lookback.default_days, chrono::Utc::now(), config.verdicts.clone())?;
//! let output = Orchestrator::from_config(config)?.run(&window).await?;
//! println!("{} incidents", output.records.len());
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod fetch;
pub mod init;
pub mod merge;
pub mod model;
pub mod orchestrator;
pub mod pacer;
pub mod paginate;
pub mod retry;
pub mod transport;
pub mod window;

pub use config::{ApiToken, IngestConfig};
pub use error::{IngestError, IngestResult};
pub use init::{InitializationGuard, SessionProbe};
pub use merge::{RecordShaper, WhitelistFilter, flatten_record};
pub use model::{
    EnrichmentReport, EnrichmentStatus, Incident, IncidentId, MergedRecord, RunSummary,
    SubResourceStatus,
};
pub use orchestrator::{Orchestrator, RunOutput, RunState, ShutdownSignal};
pub use retry::{BackoffSchedule, RetryDecision};
pub use transport::{ApiRequest, ApiTransport, HttpTransport};
pub use window::{FetchWindow, LookbackLimits};
