//! Sub-resource fetchers.
//!
//! Notes and indicators are plain cursor-paged lists under an
//! incident-scoped path and share [`PagedFetcher`]. Deep-visibility events
//! come from an asynchronous power-query that is submitted, polled until it
//! finishes, and bounded by a wall-clock timeout.

use std::marker::PhantomData;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Map, Value, json};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, instrument, warn};

use crate::config::{DeepVisibilityConfig, EndpointConfig};
use crate::error::{IngestError, IngestResult};
use crate::model::{
    DeepVisibilityEvent, Incident, IncidentId, Indicator, Note, SubResourceStatus,
    non_empty_str, parse_timestamp,
};
use crate::paginate::Paginator;
use crate::transport::{ApiRequest, ApiTransport};

/// Items fetched for one sub-resource plus how the fetch ended.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub items: Vec<T>,
    pub status: SubResourceStatus,
}

impl<T> Fetched<T> {
    fn ok(items: Vec<T>) -> Self {
        let status = SubResourceStatus::Fetched { count: items.len() };
        Self { items, status }
    }

    fn empty(status: SubResourceStatus) -> Self {
        Self {
            items: Vec::new(),
            status,
        }
    }
}

/// An item type served by an incident-scoped paged endpoint.
pub trait SubResource: Sized + Send {
    /// Name used in logs.
    const NAME: &'static str;

    /// Convert one listing item; `None` skips it.
    fn from_item(item: Value) -> Option<Self>;

    /// Post-process the complete list.
    fn finish(_items: &mut Vec<Self>) {}
}

impl SubResource for Note {
    const NAME: &'static str = "notes";

    fn from_item(item: Value) -> Option<Self> {
        let text = non_empty_str(item.get("body")).or_else(|| non_empty_str(item.get("text")))?;
        let created_at = item
            .get("createdAt")
            .and_then(Value::as_str)
            .and_then(parse_timestamp);
        Some(Self { text, created_at })
    }

    /// Chronological; undated notes go last in listing order.
    fn finish(items: &mut Vec<Self>) {
        items.sort_by_key(|n| (n.created_at.is_none(), n.created_at));
    }
}

impl SubResource for Indicator {
    const NAME: &'static str = "indicators";

    fn from_item(item: Value) -> Option<Self> {
        match item {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }
}

/// Fetches every page of one incident-scoped endpoint.
#[derive(Debug, Clone)]
pub struct PagedFetcher<T> {
    template: String,
    page_limit: u32,
    _item: PhantomData<fn() -> T>,
}

impl<T: SubResource> PagedFetcher<T> {
    /// `template` contains an `{id}` placeholder.
    #[must_use]
    pub fn new(template: impl Into<String>, page_limit: u32) -> Self {
        Self {
            template: template.into(),
            page_limit,
            _item: PhantomData,
        }
    }

    #[must_use]
    pub fn path_for(&self, id: &IncidentId) -> String {
        self.template.replace("{id}", id.as_str())
    }

    /// Fetch every page for `id`.
    ///
    /// Never fails: a page error ends the listing, keeps the items already
    /// fetched and marks the sub-resource `Failed`.
    #[instrument(skip(self, transport), fields(resource = T::NAME, incident_id = %id))]
    pub async fn fetch(&self, transport: &dyn ApiTransport, id: &IncidentId) -> Fetched<T> {
        let listing = Paginator::new(transport, ApiRequest::get(self.path_for(id)), self.page_limit)
            .collect_all()
            .await;
        let mut items: Vec<T> = listing.items.into_iter().filter_map(T::from_item).collect();
        T::finish(&mut items);

        match listing.error {
            None => {
                debug!(count = items.len(), pages = listing.pages, "fetched sub-resource");
                Fetched::ok(items)
            }
            Some(err) => {
                warn!(
                    pages = listing.pages,
                    kept = items.len(),
                    error = %err,
                    "sub-resource listing stopped early"
                );
                Fetched {
                    items,
                    status: SubResourceStatus::Failed {
                        error: err.to_string(),
                    },
                }
            }
        }
    }
}

/// Keep the newest notes whose space-joined length fits in `max_chars`.
///
/// Returns texts in chronological order. When the budget runs out part way
/// through a note, the tail of that note is kept.
#[must_use]
pub fn select_recent_notes(notes: &[Note], max_chars: usize) -> Vec<String> {
    let mut kept: Vec<String> = Vec::new();
    let mut remaining = max_chars;

    for note in notes.iter().rev() {
        let separator = usize::from(!kept.is_empty());
        if remaining <= separator {
            break;
        }
        let available = remaining - separator;
        let len = note.text.chars().count();
        if len <= available {
            kept.push(note.text.clone());
            remaining = available - len;
        } else {
            kept.push(note.text.chars().skip(len - available).collect());
            break;
        }
    }

    kept.reverse();
    kept
}

/// Submits and polls deep-visibility power-queries.
#[derive(Debug, Clone)]
pub struct DeepVisibilityFetcher {
    settings: DeepVisibilityConfig,
    submit_path: String,
    ping_path: String,
}

impl DeepVisibilityFetcher {
    #[must_use]
    pub fn new(settings: DeepVisibilityConfig, endpoints: &EndpointConfig) -> Self {
        Self {
            settings,
            submit_path: endpoints.power_query.clone(),
            ping_path: endpoints.power_query_ping.clone(),
        }
    }

    /// Power-query text for `incident`, or `None` when there is nothing to
    /// correlate on.
    #[must_use]
    pub fn build_query(&self, incident: &Incident) -> Option<String> {
        let mut clauses = Vec::new();
        if let Some(story) = &incident.storyline {
            clauses.push(format!("src.process.storyline.id == '{}'", escape(story)));
        }
        if let (Some(agent), Some((algo, hash))) = (&incident.agent_uuid, incident.hashes.preferred()) {
            clauses.push(format!(
                "(src.process.image.{algo} == '{}' and agent.uuid == '{}')",
                escape(hash),
                escape(agent)
            ));
        }
        if clauses.is_empty() {
            return None;
        }

        // Rows come back as arrays, so the query always names its columns.
        Some(format!(
            "{} | columns {} | sort {}",
            clauses.join(" or "),
            self.column_order().join(", "),
            self.settings.sort_field
        ))
    }

    /// Sort field first, then the configured columns.
    fn column_order(&self) -> Vec<String> {
        let mut columns = vec![self.settings.sort_field.clone()];
        for column in &self.settings.columns {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
        columns
    }

    /// Query window around the incident's creation time.
    #[must_use]
    pub fn query_window(&self, incident: &Incident) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            incident.created_at - ChronoDuration::seconds(self.settings.window_before_secs),
            incident.created_at + ChronoDuration::seconds(self.settings.window_after_secs),
        )
    }

    /// Fetch events for `incident`. Incidents created before `cutoff` are
    /// skipped. Never fails: errors and timeouts are folded into the status.
    #[instrument(skip_all, fields(incident_id = %incident.id))]
    pub async fn fetch(
        &self,
        transport: &dyn ApiTransport,
        incident: &Incident,
        cutoff: DateTime<Utc>,
    ) -> Fetched<DeepVisibilityEvent> {
        if !self.settings.enabled {
            return Fetched::empty(skipped("deep visibility disabled"));
        }
        if incident.created_at < cutoff {
            debug!(created_at = %incident.created_at, %cutoff, "incident older than deep-visibility lookback");
            return Fetched::empty(skipped("older than deep-visibility lookback"));
        }
        let Some(query) = self.build_query(incident) else {
            return Fetched::empty(skipped("no storyline or hash and agent to query"));
        };

        let budget = self.settings.timeout();
        let started = Instant::now();
        match timeout(budget, self.run_query(transport, incident, &query)).await {
            Ok(Ok(events)) => Fetched::ok(events),
            Ok(Err(err)) => {
                warn!(incident_id = %incident.id, error = %err, "deep-visibility query failed");
                Fetched::empty(SubResourceStatus::Failed {
                    error: err.to_string(),
                })
            }
            Err(_) => {
                let after_ms = duration_ms(started.elapsed());
                warn!(
                    incident_id = %incident.id,
                    timeout_ms = duration_ms(budget),
                    "deep-visibility query timed out"
                );
                Fetched::empty(SubResourceStatus::TimedOut { after_ms })
            }
        }
    }

    async fn run_query(
        &self,
        transport: &dyn ApiTransport,
        incident: &Incident,
        query: &str,
    ) -> IngestResult<Vec<DeepVisibilityEvent>> {
        let (from, to) = self.query_window(incident);
        let mut body = json!({
            "query": query,
            "fromDate": from.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            "toDate": to.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            "limit": self.settings.result_limit,
        });
        if let Some(site) = &incident.site_id {
            body["siteIds"] = json!([site]);
        }
        if let Some(account) = &incident.account_id {
            body["accountIds"] = json!([account]);
        }
        debug!(%query, "submitting power-query");

        let submitted = transport
            .execute(&ApiRequest::post(self.submit_path.clone(), body))
            .await?;
        let mut data = submitted.get("data").cloned().unwrap_or(Value::Null);
        let query_id = non_empty_str(data.get("queryId"))
            .ok_or_else(|| IngestError::Protocol("power-query response has no queryId".into()))?;

        let mut polls: u32 = 0;
        loop {
            let status = query_status(&data);
            if is_finished(status) {
                break;
            }
            if let Some(failed) = failure(status) {
                return Err(IngestError::QueryFailed {
                    query_id,
                    message: failed,
                });
            }
            if polls > 0 {
                sleep(self.settings.poll_interval()).await;
            }
            polls += 1;
            let ping = transport
                .execute(&ApiRequest::get(self.ping_path.clone()).with_query("queryId", query_id.clone()))
                .await?;
            data = ping.get("data").cloned().unwrap_or(Value::Null);
            debug!(%query_id, polls, status = ?query_status(&data), "polled power-query");
        }

        let events = self.parse_rows(&data);
        debug!(%query_id, count = events.len(), "power-query finished");
        Ok(events)
    }

    /// Turn a finished query payload into events sorted by the sort field.
    #[must_use]
    pub fn parse_rows(&self, data: &Value) -> Vec<DeepVisibilityEvent> {
        let columns = response_columns(data).unwrap_or_else(|| self.column_order());
        let rows = data.get("data").and_then(Value::as_array);

        let mut events: Vec<DeepVisibilityEvent> = rows
            .into_iter()
            .flatten()
            .filter_map(|row| {
                let fields: Map<String, Value> = match row {
                    Value::Object(map) => map.clone(),
                    Value::Array(values) => columns.iter().cloned().zip(values.iter().cloned()).collect(),
                    _ => return None,
                };
                let fields: Map<String, Value> =
                    fields.into_iter().filter(|(_, v)| is_meaningful(v)).collect();
                (!fields.is_empty()).then_some(DeepVisibilityEvent { fields })
            })
            .collect();

        let sort_field = &self.settings.sort_field;
        events.sort_by(|a, b| a.cmp_by(b, sort_field));
        events
    }
}

fn skipped(reason: &str) -> SubResourceStatus {
    SubResourceStatus::Skipped {
        reason: reason.to_string(),
    }
}

fn query_status(data: &Value) -> Option<&Value> {
    data.get("status")
        .filter(|v| !v.is_null())
        .or_else(|| data.get("progress"))
}

fn is_finished(status: Option<&Value>) -> bool {
    match status {
        Some(Value::String(s)) => matches!(s.as_str(), "FINISHED" | "SUCCEEDED"),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|p| p >= 100.0),
        _ => false,
    }
}

fn failure(status: Option<&Value>) -> Option<String> {
    match status {
        Some(Value::String(s)) if s.starts_with("FAILED") => Some(s.clone()),
        _ => None,
    }
}

/// Column names reported by the query itself, if any.
fn response_columns(data: &Value) -> Option<Vec<String>> {
    let columns = data.get("columns")?.as_array()?;
    let names: Vec<String> = columns
        .iter()
        .filter_map(|c| match c {
            Value::String(s) => Some(s.clone()),
            Value::Object(o) => o.get("name").and_then(Value::as_str).map(String::from),
            _ => None,
        })
        .collect();
    (names.len() == columns.len() && !names.is_empty()).then_some(names)
}

/// Null, empty-string and numeric-zero cells carry no information.
fn is_meaningful(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_none_or(|x| x != 0.0),
        _ => true,
    }
}

fn escape(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('\'', "\\'")
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
