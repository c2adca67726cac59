//! Fetch window and lookback limits.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, IngestResult};

/// Configured lookback maxima, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookbackLimits {
    pub general_days: u32,
    pub incident_days: u32,
    pub deep_visibility_days: u32,
}

impl LookbackLimits {
    /// The bound applied to the incident listing: the smaller of the general
    /// and incident maxima.
    #[must_use]
    pub fn listing_days(&self) -> u32 {
        self.general_days.min(self.incident_days)
    }
}

/// Immutable time range and verdict filter bounding eligible incidents.
///
/// Deserializing goes through [`FetchWindow::new`], so an inverted range is
/// rejected there too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WindowBounds")]
pub struct FetchWindow {
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    verdicts: Vec<String>,
}

#[derive(Deserialize)]
struct WindowBounds {
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    #[serde(default)]
    verdicts: Vec<String>,
}

impl TryFrom<WindowBounds> for FetchWindow {
    type Error = IngestError;

    fn try_from(bounds: WindowBounds) -> IngestResult<Self> {
        Self::new(bounds.since, bounds.until, bounds.verdicts)
    }
}

impl FetchWindow {
    /// Build a window from explicit bounds.
    ///
    /// # Errors
    /// Returns `IngestError::InvalidWindow` if `since` is after `until`.
    pub fn new(
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        verdicts: Vec<String>,
    ) -> IngestResult<Self> {
        if since > until {
            return Err(IngestError::InvalidWindow(format!(
                "since {} is after until {}",
                rfc3339(since),
                rfc3339(until)
            )));
        }
        let verdicts = verdicts
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        Ok(Self {
            since,
            until,
            verdicts,
        })
    }

    /// Window covering the `days` before `until`.
    ///
    /// # Errors
    /// Returns `IngestError::InvalidWindow` if `days` is zero.
    pub fn lookback(days: u32, until: DateTime<Utc>, verdicts: Vec<String>) -> IngestResult<Self> {
        if days == 0 {
            return Err(IngestError::InvalidWindow(
                "lookback must be at least one day".into(),
            ));
        }
        Self::new(until - ChronoDuration::days(i64::from(days)), until, verdicts)
    }

    #[must_use]
    pub const fn since(&self) -> DateTime<Utc> {
        self.since
    }

    #[must_use]
    pub const fn until(&self) -> DateTime<Utc> {
        self.until
    }

    #[must_use]
    pub fn verdicts(&self) -> &[String] {
        &self.verdicts
    }

    #[must_use]
    pub fn span(&self) -> ChronoDuration {
        self.until - self.since
    }

    /// Reject windows longer than the strictest listing bound.
    ///
    /// # Errors
    /// Returns `IngestError::InvalidWindow` naming the violated bound.
    pub fn validate_listing(&self, limits: &LookbackLimits) -> IngestResult<()> {
        let max_days = limits.listing_days();
        if self.span() > ChronoDuration::days(i64::from(max_days)) {
            let which = if limits.incident_days <= limits.general_days {
                "incident"
            } else {
                "general"
            };
            return Err(IngestError::InvalidWindow(format!(
                "window of {} days exceeds the {which} lookback maximum of {max_days} days",
                self.span().num_days()
            )));
        }
        Ok(())
    }

    /// Incidents created before this instant get no deep-visibility query.
    #[must_use]
    pub fn deep_visibility_cutoff(&self, limits: &LookbackLimits) -> DateTime<Utc> {
        self.until - ChronoDuration::days(i64::from(limits.deep_visibility_days))
    }

    /// Inclusive on both ends.
    #[must_use]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.since <= ts && ts <= self.until
    }

    /// Query parameters for the incident listing.
    #[must_use]
    pub fn listing_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("createdAt__gte".to_string(), rfc3339(self.since)),
            ("createdAt__lte".to_string(), rfc3339(self.until)),
        ];
        if !self.verdicts.is_empty() {
            params.push(("analystVerdicts".to_string(), self.verdicts.join(",")));
        }
        params
    }
}

/// RFC 3339 with millisecond precision and a `Z` suffix.
#[must_use]
pub fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
