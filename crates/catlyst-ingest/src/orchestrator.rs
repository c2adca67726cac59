//! Fetch orchestrator.
//!
//! One run walks `Idle → Initializing → Listing → Enriching → Draining →
//! Done`, or drops to `Failed` from initialization or listing. Enrichment is
//! a fixed pool of workers pulling listing positions from a bounded queue;
//! results come back tagged with their position so output order always
//! matches listing order.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::IngestConfig;
use crate::error::{IngestError, IngestResult};
use crate::fetch::{DeepVisibilityFetcher, PagedFetcher};
use crate::init::{InitializationGuard, SessionProbe};
use crate::merge::RecordShaper;
use crate::model::{
    EnrichmentReport, EnrichmentStatus, Incident, Indicator, MergedRecord, Note, RunSummary,
    SubResourceStatus,
};
use crate::paginate::{Paginator, PartialListing};
use crate::transport::{ApiRequest, ApiTransport, HttpTransport};
use crate::window::FetchWindow;

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Initializing,
    Listing,
    Enriching,
    Draining,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Listing => "listing",
            Self::Enriching => "enriching",
            Self::Draining => "draining",
            Self::Done => "done",
            Self::Failed => "failed",
        })
    }
}

/// Run-level cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop dispatching new enrichment work.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a successful run produces.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// One record per listed incident, in listing order.
    pub records: Vec<MergedRecord>,
    pub summary: RunSummary,
    pub window: FetchWindow,
}

/// Drives initialization, listing and enrichment.
pub struct Orchestrator {
    config: Arc<IngestConfig>,
    transport: Arc<dyn ApiTransport>,
    probe: Arc<dyn SessionProbe>,
    guard: InitializationGuard,
    shutdown: ShutdownSignal,
    state: Mutex<RunState>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &*self.state.lock())
            .field("max_workers", &self.config.workers.max_workers)
            .field("shutdown", &self.shutdown.is_triggered())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: Arc<IngestConfig>,
        transport: Arc<dyn ApiTransport>,
        probe: Arc<dyn SessionProbe>,
    ) -> Self {
        let guard = InitializationGuard::new(&config.init);
        Self {
            config,
            transport,
            probe,
            guard,
            shutdown: ShutdownSignal::new(),
            state: Mutex::new(RunState::Idle),
        }
    }

    /// Build with the reqwest transport serving as both API client and
    /// session probe.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: Arc<IngestConfig>) -> IngestResult<Self> {
        let http = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::new(config, http.clone(), http))
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    fn transition(&self, next: RunState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        info!(from = %previous, to = %next, "run state changed");
    }

    fn fail(&self, err: IngestError) -> IngestError {
        error!(error = %err, "run failed");
        self.transition(RunState::Failed);
        err
    }

    /// Execute one complete run over `window`.
    ///
    /// # Errors
    /// Window validation, initialization and (unless tolerated) listing
    /// failures abort the run with no records. Per-incident enrichment
    /// failures never do.
    #[instrument(skip_all, fields(since = %window.since(), until = %window.until()))]
    pub async fn run(&self, window: &FetchWindow) -> IngestResult<RunOutput> {
        let started = Instant::now();
        let limits = self.config.lookback.limits();

        if let Err(err) = window.validate_listing(&limits) {
            return Err(self.fail(err));
        }

        self.transition(RunState::Initializing);
        if let Err(err) = self.guard.establish(self.probe.as_ref()).await {
            return Err(self.fail(err));
        }

        self.transition(RunState::Listing);
        let mut summary = RunSummary::default();
        let incidents = match self.list_incidents(window, &mut summary).await {
            Ok(incidents) => incidents,
            Err(err) => return Err(self.fail(err)),
        };

        self.transition(RunState::Enriching);
        let cutoff = window.deep_visibility_cutoff(&limits);
        let records = self.enrich(incidents, cutoff).await;
        for record in &records {
            summary.record(&record.enrichment);
        }

        summary.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.transition(RunState::Done);
        info!(
            listed = summary.listed,
            complete = summary.complete,
            partial = summary.partial,
            failed = summary.failed,
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed_ms,
            "run complete"
        );

        Ok(RunOutput {
            records,
            summary,
            window: window.clone(),
        })
    }

    /// Primary listing: collect, validate and deduplicate every incident in
    /// the window before any enrichment starts.
    async fn list_incidents(
        &self,
        window: &FetchWindow,
        summary: &mut RunSummary,
    ) -> IngestResult<Vec<Incident>> {
        let mut request = ApiRequest::get(self.config.endpoints.incidents.clone());
        for (key, value) in window.listing_params() {
            request = request.with_query(key, value);
        }

        let PartialListing {
            items,
            pages,
            total_hint,
            error,
        } = Paginator::new(self.transport.as_ref(), request, self.config.paging.page_limit)
            .collect_all()
            .await;

        summary.listing_pages = pages;
        if let Some(total) = total_hint {
            info!(total, "listing reports total incidents");
        }

        if let Some(err) = error {
            if !self.config.paging.tolerate_partial_listing {
                return Err(IngestError::Listing {
                    pages,
                    items: items.len(),
                    source: Box::new(err),
                });
            }
            warn!(pages, items = items.len(), error = %err, "listing truncated, continuing with partial set");
            summary.listing_error = Some(err.to_string());
        }

        let mut seen = HashSet::new();
        let mut incidents = Vec::with_capacity(items.len());
        for item in items {
            let incident = match Incident::from_json(item) {
                Ok(incident) => incident,
                Err(err) => {
                    warn!(error = %err, "dropping malformed listing entry");
                    summary.dropped_malformed += 1;
                    continue;
                }
            };
            if !window.contains(incident.created_at) {
                debug!(incident_id = %incident.id, created_at = %incident.created_at, "dropping incident outside window");
                summary.dropped_out_of_window += 1;
                continue;
            }
            if !seen.insert(incident.id.clone()) {
                debug!(incident_id = %incident.id, "dropping duplicate incident");
                summary.dropped_duplicates += 1;
                continue;
            }
            incidents.push(incident);
        }

        summary.listed = incidents.len();
        info!(listed = incidents.len(), pages, "listing complete");
        Ok(incidents)
    }

    /// Fan enrichment out over the worker pool and collect in listing order.
    async fn enrich(&self, incidents: Vec<Incident>, cutoff: DateTime<Utc>) -> Vec<MergedRecord> {
        let total = incidents.len();
        if total == 0 {
            self.transition(RunState::Draining);
            return Vec::new();
        }

        let incidents: Arc<[Incident]> = incidents.into();
        let workers = self.config.workers.max_workers.min(total).max(1);
        let ctx = Arc::new(WorkerContext::new(
            &self.config,
            Arc::clone(&self.transport),
            cutoff,
            total,
        ));

        let (task_tx, task_rx) = mpsc::channel::<usize>(workers);
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, MergedRecord)>();

        info!(total, workers, "starting enrichment");
        let mut join_set = JoinSet::new();
        for worker in 0..workers {
            let ctx = Arc::clone(&ctx);
            let incidents = Arc::clone(&incidents);
            let task_rx = Arc::clone(&task_rx);
            let result_tx = result_tx.clone();
            let shutdown = self.shutdown.clone();
            join_set.spawn(async move {
                loop {
                    let next = task_rx.lock().await.recv().await;
                    let Some(idx) = next else { break };
                    let incident = &incidents[idx];
                    let record = if shutdown.is_triggered() {
                        cancelled_record(incident, &ctx.shaper)
                    } else {
                        ctx.enrich(incident).await
                    };
                    if result_tx.send((idx, record)).is_err() {
                        break;
                    }
                }
                debug!(worker, "worker finished");
            });
        }
        drop(result_tx);
        drop(task_rx);

        let mut dispatched = 0;
        for idx in 0..total {
            if self.shutdown.is_triggered() {
                warn!(dispatched = idx, total, "shutdown requested, stopping dispatch");
                break;
            }
            if task_tx.send(idx).await.is_err() {
                break;
            }
            dispatched = idx + 1;
        }
        drop(task_tx);
        self.transition(RunState::Draining);

        let mut slots: Vec<Option<MergedRecord>> = vec![None; total];
        for (idx, slot) in slots.iter_mut().enumerate().skip(dispatched) {
            *slot = Some(cancelled_record(&incidents[idx], &ctx.shaper));
        }
        while let Some((idx, record)) = result_rx.recv().await {
            slots[idx] = Some(record);
        }
        while let Some(joined) = join_set.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "enrichment worker aborted");
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| aborted_record(&incidents[idx], &ctx.shaper))
            })
            .collect()
    }
}

/// Shared, read-only state for enrichment workers plus the progress tally.
struct WorkerContext {
    transport: Arc<dyn ApiTransport>,
    notes: PagedFetcher<Note>,
    indicators: PagedFetcher<Indicator>,
    deep_visibility: DeepVisibilityFetcher,
    shaper: RecordShaper,
    cutoff: DateTime<Utc>,
    completed: AtomicU64,
    total: u64,
    progress_interval: u64,
}

impl WorkerContext {
    fn new(
        config: &IngestConfig,
        transport: Arc<dyn ApiTransport>,
        cutoff: DateTime<Utc>,
        total: usize,
    ) -> Self {
        Self {
            transport,
            notes: PagedFetcher::new(config.endpoints.notes.clone(), config.paging.note_page_limit),
            indicators: PagedFetcher::new(
                config.endpoints.indicators.clone(),
                config.paging.indicator_page_limit,
            ),
            deep_visibility: DeepVisibilityFetcher::new(
                config.deep_visibility.clone(),
                &config.endpoints,
            ),
            shaper: RecordShaper::new(&config.filter),
            cutoff,
            completed: AtomicU64::new(0),
            total: u64::try_from(total).unwrap_or(u64::MAX),
            progress_interval: u64::try_from(config.workers.progress_interval.max(1))
                .unwrap_or(u64::MAX),
        }
    }

    /// One network call at a time: notes, indicators, deep visibility.
    #[instrument(skip_all, fields(incident_id = %incident.id))]
    async fn enrich(&self, incident: &Incident) -> MergedRecord {
        let transport = self.transport.as_ref();
        let notes = self.notes.fetch(transport, &incident.id).await;
        let indicators = self.indicators.fetch(transport, &incident.id).await;
        let events = self
            .deep_visibility
            .fetch(transport, incident, self.cutoff)
            .await;

        let report = EnrichmentReport::new(events.status, notes.status, indicators.status);
        let record = self
            .shaper
            .shape(incident, &events.items, &notes.items, &indicators.items);

        if report.status != EnrichmentStatus::Complete {
            warn!(status = ?report.status, "incident enriched with degraded sub-resources");
        }

        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if done % self.progress_interval == 0 || done == self.total {
            info!(completed = done, total = self.total, "enrichment progress");
        }

        MergedRecord {
            incident_id: incident.id.clone(),
            enrichment: report,
            record,
        }
    }
}

fn cancelled_record(incident: &Incident, shaper: &RecordShaper) -> MergedRecord {
    MergedRecord {
        incident_id: incident.id.clone(),
        enrichment: EnrichmentReport::cancelled(),
        record: shaper.shape(incident, &[], &[], &[]),
    }
}

fn aborted_record(incident: &Incident, shaper: &RecordShaper) -> MergedRecord {
    let failed = || SubResourceStatus::Failed {
        error: "enrichment worker aborted".into(),
    };
    MergedRecord {
        incident_id: incident.id.clone(),
        enrichment: EnrichmentReport::new(failed(), failed(), failed()),
        record: shaper.shape(incident, &[], &[], &[]),
    }
}
