//! Incident data model and enrichment bookkeeping.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{IngestError, IngestResult};

/// Opaque incident identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncidentId(String);

impl IncidentId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// File hashes attached to an incident.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hashes {
    pub sha1: Option<String>,
    pub sha256: Option<String>,
    pub md5: Option<String>,
}

impl Hashes {
    /// Strongest available hash as `(algorithm, value)`: sha256, then sha1,
    /// then md5.
    #[must_use]
    pub fn preferred(&self) -> Option<(&'static str, &str)> {
        [
            ("sha256", &self.sha256),
            ("sha1", &self.sha1),
            ("md5", &self.md5),
        ]
        .into_iter()
        .find_map(|(name, value)| value.as_deref().map(|v| (name, v)))
    }
}

/// One incident from the primary listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    pub id: IncidentId,
    pub created_at: DateTime<Utc>,
    pub verdict: Option<String>,
    pub hashes: Hashes,
    pub storyline: Option<String>,
    pub agent_uuid: Option<String>,
    /// Scope of the detecting agent, used to narrow power-queries.
    pub site_id: Option<String>,
    pub account_id: Option<String>,
    /// The listing entry as received.
    pub raw: Map<String, Value>,
}

impl Incident {
    /// Parse a listing entry.
    ///
    /// # Errors
    /// Returns `IngestError::Protocol` if the entry is not an object, has no
    /// identifier, or has no parseable creation timestamp.
    pub fn from_json(value: Value) -> IngestResult<Self> {
        let Value::Object(raw) = value else {
            return Err(IngestError::Protocol("incident entry is not an object".into()));
        };

        let info = raw.get("threatInfo").and_then(Value::as_object);
        let info_str = |key: &str| info.and_then(|i| non_empty_str(i.get(key)));

        let id = non_empty_str(raw.get("id"))
            .or_else(|| info_str("threatId"))
            .ok_or_else(|| IngestError::Protocol("incident has no id".into()))?;

        let created_raw = info_str("createdAt")
            .or_else(|| non_empty_str(raw.get("createdAt")))
            .ok_or_else(|| IngestError::Protocol(format!("incident {id} has no createdAt")))?;
        let created_at = parse_timestamp(&created_raw).ok_or_else(|| {
            IngestError::Protocol(format!("incident {id} has invalid createdAt '{created_raw}'"))
        })?;

        let agent_uuid = raw
            .get("agentRealtimeInfo")
            .and_then(|a| non_empty_str(a.get("agentUuid")))
            .or_else(|| {
                raw.get("agentDetectionInfo")
                    .and_then(|a| non_empty_str(a.get("agentUuid")))
            });

        let detection = raw.get("agentDetectionInfo");
        let site_id = detection.and_then(|a| non_empty_str(a.get("siteId")));
        let account_id = detection.and_then(|a| non_empty_str(a.get("accountId")));

        let verdict = info_str("analystVerdict");
        let storyline = info_str("storyline");
        let hashes = Hashes {
            sha1: info_str("sha1"),
            sha256: info_str("sha256"),
            md5: info_str("md5"),
        };

        Ok(Self {
            id: IncidentId::new(id),
            created_at,
            verdict,
            hashes,
            storyline,
            agent_uuid,
            site_id,
            account_id,
            raw,
        })
    }
}

/// One deep-visibility event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeepVisibilityEvent {
    pub fields: Map<String, Value>,
}

impl DeepVisibilityEvent {
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Order two events by `field`. Numbers compare numerically, everything
    /// else by its string form; events missing the field sort last.
    #[must_use]
    pub fn cmp_by(&self, other: &Self, field: &str) -> Ordering {
        match (self.get(field), other.get(field)) {
            (Some(a), Some(b)) => compare_values(a, b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        _ => value_text(a).cmp(&value_text(b)),
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Analyst note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Indicator classification tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Indicator {
    pub fields: Map<String, Value>,
}

impl Indicator {
    #[must_use]
    pub fn category(&self) -> Option<&str> {
        self.fields.get("category").and_then(Value::as_str)
    }
}

/// Outcome of one sub-resource fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubResourceStatus {
    Fetched { count: usize },
    /// Not attempted by policy. Not a degradation.
    Skipped { reason: String },
    TimedOut { after_ms: u64 },
    Failed { error: String },
    Cancelled,
}

impl SubResourceStatus {
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        matches!(self, Self::TimedOut { .. } | Self::Failed { .. })
    }
}

/// Overall enrichment outcome of one incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Complete,
    Partial,
    Failed,
    Cancelled,
}

/// Per-incident enrichment report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentReport {
    pub status: EnrichmentStatus,
    pub deep_visibility: SubResourceStatus,
    pub notes: SubResourceStatus,
    pub indicators: SubResourceStatus,
}

impl EnrichmentReport {
    /// Derive the overall status from the three sub-resource outcomes.
    ///
    /// `Failed` means nothing was fetched and at least one fetch errored;
    /// a timeout alone never makes an incident `Failed`.
    #[must_use]
    pub fn new(
        deep_visibility: SubResourceStatus,
        notes: SubResourceStatus,
        indicators: SubResourceStatus,
    ) -> Self {
        let parts = [&deep_visibility, &notes, &indicators];
        let status = if parts.iter().all(|s| matches!(s, SubResourceStatus::Cancelled)) {
            EnrichmentStatus::Cancelled
        } else if !parts.iter().any(|s| s.is_degraded()) {
            EnrichmentStatus::Complete
        } else if !parts
            .iter()
            .any(|s| matches!(s, SubResourceStatus::Fetched { .. }))
            && parts
                .iter()
                .any(|s| matches!(s, SubResourceStatus::Failed { .. }))
        {
            EnrichmentStatus::Failed
        } else {
            EnrichmentStatus::Partial
        };
        Self {
            status,
            deep_visibility,
            notes,
            indicators,
        }
    }

    /// Report for an incident that was never dispatched.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(
            SubResourceStatus::Cancelled,
            SubResourceStatus::Cancelled,
            SubResourceStatus::Cancelled,
        )
    }
}

/// Terminal output unit: one per listed incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub incident_id: IncidentId,
    pub enrichment: EnrichmentReport,
    /// Merged incident projected through the whitelist.
    pub record: Value,
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub listed: usize,
    pub listing_pages: u32,
    pub complete: usize,
    pub partial: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub deep_visibility_timeouts: usize,
    pub dropped_duplicates: usize,
    pub dropped_out_of_window: usize,
    pub dropped_malformed: usize,
    /// Set when a tolerated listing failure truncated the run.
    pub listing_error: Option<String>,
    pub elapsed_ms: u64,
}

impl RunSummary {
    /// Tally one record's outcome.
    pub fn record(&mut self, report: &EnrichmentReport) {
        match report.status {
            EnrichmentStatus::Complete => self.complete += 1,
            EnrichmentStatus::Partial => self.partial += 1,
            EnrichmentStatus::Failed => self.failed += 1,
            EnrichmentStatus::Cancelled => self.cancelled += 1,
        }
        if matches!(report.deep_visibility, SubResourceStatus::TimedOut { .. }) {
            self.deep_visibility_timeouts += 1;
        }
    }

    #[must_use]
    pub const fn emitted(&self) -> usize {
        self.complete + self.partial + self.failed + self.cancelled
    }
}

/// Parse an RFC 3339 timestamp; a missing offset is read as UTC.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

pub(crate) fn non_empty_str(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
