//! Engine configuration.
//!
//! [`IngestConfig`] is built once at startup and shared read-only
//! (`Arc<IngestConfig>`) with every component. Values are layered:
//! defaults, then an optional TOML file, then `S1_*` environment variables,
//! then whatever the caller overrides programmatically (CLI flags).

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::{IngestError, IngestResult};
use crate::window::LookbackLimits;

/// Management API token. Never printed in clear.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ApiToken(String);

impl ApiToken {
    /// Wrap a raw token.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Raw token value for the `Authorization` header.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    fn redacted(&self) -> &'static str {
        if self.is_empty() { "<unset>" } else { "***" }
    }
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiToken({})", self.redacted())
    }
}

impl fmt::Display for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.redacted())
    }
}

impl Serialize for ApiToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.redacted())
    }
}

/// Connection settings for the management API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Management console base URL (scheme + host).
    pub management_url: String,
    /// API token sent as `Authorization: ApiToken <token>`.
    pub api_token: ApiToken,
    /// API version segment, e.g. `v2.1`.
    pub api_version: String,
    /// Verify TLS certificates.
    pub verify_ssl: bool,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: f64,
    /// Endpoint probed by the initialization guard.
    pub auth_check_path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            management_url: String::new(),
            api_token: ApiToken::default(),
            api_version: "v2.1".into(),
            verify_ssl: true,
            request_timeout_secs: 120.0,
            auth_check_path: "system/status".into(),
        }
    }
}

impl ApiConfig {
    /// `{management_url}/web/api/{api_version}` without trailing slash.
    #[must_use]
    pub fn api_prefix(&self) -> String {
        format!(
            "{}/web/api/{}",
            self.management_url.trim_end_matches('/'),
            self.api_version.trim_matches('/')
        )
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        secs_to_duration(self.request_timeout_secs, Duration::from_secs(120))
    }
}

/// Transport retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            jitter: true,
        }
    }
}

/// Page sizes for the listing and sub-resource endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    pub page_limit: u32,
    pub note_page_limit: u32,
    pub indicator_page_limit: u32,
    /// Keep the incidents listed before a page failure instead of aborting.
    pub tolerate_partial_listing: bool,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_limit: 1_000,
            note_page_limit: 1_000,
            indicator_page_limit: 1_000,
            tolerate_partial_listing: false,
        }
    }
}

/// Enrichment worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_workers: usize,
    /// Log a progress line every N enriched incidents.
    pub progress_interval: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: 200,
            progress_interval: 100,
        }
    }
}

/// Initialization guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    /// Total session establishment attempts before the run fails.
    pub max_init_retry: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            max_init_retry: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

/// Lookback defaults and maxima, in days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookbackConfig {
    pub default_days: u32,
    pub max_days: u32,
    pub max_incident_days: u32,
    pub max_deep_visibility_days: u32,
}

impl Default for LookbackConfig {
    fn default() -> Self {
        Self {
            default_days: 1,
            max_days: 365,
            max_incident_days: 365,
            max_deep_visibility_days: 90,
        }
    }
}

impl LookbackConfig {
    #[must_use]
    pub const fn limits(&self) -> LookbackLimits {
        LookbackLimits {
            general_days: self.max_days,
            incident_days: self.max_incident_days,
            deep_visibility_days: self.max_deep_visibility_days,
        }
    }
}

/// Deep-visibility power-query settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepVisibilityConfig {
    pub enabled: bool,
    /// Wall-clock budget for one incident's query, in seconds.
    pub timeout_secs: f64,
    pub poll_interval_ms: u64,
    /// Query window opens this many seconds before the incident.
    pub window_before_secs: i64,
    /// Query window closes this many seconds after the incident.
    pub window_after_secs: i64,
    pub columns: Vec<String>,
    pub sort_field: String,
    pub result_limit: u32,
}

impl Default for DeepVisibilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 120.0,
            poll_interval_ms: 5_000,
            window_before_secs: 60,
            window_after_secs: 60,
            columns: vec![
                "event.type".into(),
                "event.category".into(),
                "severity".into(),
            ],
            sort_field: "event.time".into(),
            result_limit: 1_000,
        }
    }
}

impl DeepVisibilityConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        secs_to_duration(self.timeout_secs, Duration::from_secs(120))
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Output shaping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Dot-separated allow-list applied to every merged record.
    pub whitelist: Vec<String>,
    /// Dot-separated paths removed from the incident before merging.
    /// `*` matches every element of an array.
    pub ignore_fields: Vec<String>,
    /// Character budget for the retained notes.
    pub notes_max_len: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            whitelist: [
                "threatInfo.threatId",
                "threatInfo.storyline",
                "threatInfo.createdAt",
                "threatInfo.analystVerdict",
                "threatInfo.detectionEngines",
                "threatInfo.sha1",
                "threatInfo.sha256",
                "threatInfo.md5",
                "deepVisibilityEvents",
                "indicators",
                "notes",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            ignore_fields: Vec::new(),
            notes_max_len: 5_000,
        }
    }
}

/// Endpoint paths relative to the API prefix. `{id}` is the incident id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub incidents: String,
    pub notes: String,
    pub indicators: String,
    pub power_query: String,
    pub power_query_ping: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            incidents: "threats".into(),
            notes: "threats/{id}/notes".into(),
            indicators: "threats/{id}/indicators".into(),
            power_query: "dv/events/pq".into(),
            power_query_ping: "dv/events/pq-ping".into(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub api: ApiConfig,
    pub retry: RetrySettings,
    pub paging: PagingConfig,
    pub workers: WorkerConfig,
    pub init: InitConfig,
    pub lookback: LookbackConfig,
    pub deep_visibility: DeepVisibilityConfig,
    pub filter: FilterConfig,
    pub endpoints: EndpointConfig,
    /// Analyst verdicts included in the listing.
    pub verdicts: Vec<String>,
    /// Client-side request pacing shared by all workers.
    pub requests_per_second: Option<f64>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            retry: RetrySettings::default(),
            paging: PagingConfig::default(),
            workers: WorkerConfig::default(),
            init: InitConfig::default(),
            lookback: LookbackConfig::default(),
            deep_visibility: DeepVisibilityConfig::default(),
            filter: FilterConfig::default(),
            endpoints: EndpointConfig::default(),
            verdicts: vec!["true_positive".into(), "false_positive".into()],
            requests_per_second: None,
        }
    }
}

impl IngestConfig {
    /// Parse configuration from TOML text. Missing keys take defaults.
    ///
    /// # Errors
    /// Returns `IngestError::Config` if the document is malformed.
    pub fn from_toml_str(raw: &str) -> IngestResult<Self> {
        toml::from_str(raw).map_err(|e| IngestError::Config(format!("invalid TOML: {e}")))
    }

    /// Load from an optional TOML file, falling back to defaults.
    ///
    /// # Errors
    /// Returns `IngestError::Config` if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> IngestResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Overlay `S1_*` variables from the process environment.
    ///
    /// # Errors
    /// Returns `IngestError::Config` if a variable cannot be parsed.
    pub fn with_process_env(self) -> IngestResult<Self> {
        self.with_env(|name| std::env::var(name).ok())
    }

    /// Overlay `S1_*` variables obtained through `lookup`.
    ///
    /// # Errors
    /// Returns `IngestError::Config` if a variable cannot be parsed.
    pub fn with_env<F>(mut self, lookup: F) -> IngestResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("S1_MANAGEMENT_URL") {
            self.api.management_url = v;
        }
        if let Some(v) = lookup("S1_API_TOKEN") {
            self.api.api_token = ApiToken::new(v);
        }
        if let Some(v) = lookup("S1_API_VERSION") {
            self.api.api_version = v;
        }
        if let Some(v) = lookup("S1_VERIFY_SSL") {
            self.api.verify_ssl = parse_bool("S1_VERIFY_SSL", &v)?;
        }
        if let Some(v) = lookup("S1_PAGE_LIMIT") {
            self.paging.page_limit = parse_env("S1_PAGE_LIMIT", &v)?;
        }
        if let Some(v) = lookup("S1_NOTE_PAGE") {
            self.paging.note_page_limit = parse_env("S1_NOTE_PAGE", &v)?;
        }
        if let Some(v) = lookup("S1_MAX_WORKERS") {
            self.workers.max_workers = parse_env("S1_MAX_WORKERS", &v)?;
        }
        if let Some(v) = lookup("S1_DV_TIMEOUT") {
            self.deep_visibility.timeout_secs = parse_env("S1_DV_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("S1_MAX_INIT_RETRY") {
            self.init.max_init_retry = parse_env("S1_MAX_INIT_RETRY", &v)?;
        }
        if let Some(v) = lookup("S1_LOOKBACK_DAYS") {
            self.lookback.default_days = parse_env("S1_LOOKBACK_DAYS", &v)?;
        }
        if let Some(v) = lookup("S1_MAX_INCIDENT_LOOKBACK_DAYS") {
            self.lookback.max_incident_days = parse_env("S1_MAX_INCIDENT_LOOKBACK_DAYS", &v)?;
        }
        if let Some(v) = lookup("S1_MAX_DEEPVIS_LOOKBACK_DAYS") {
            self.lookback.max_deep_visibility_days =
                parse_env("S1_MAX_DEEPVIS_LOOKBACK_DAYS", &v)?;
        }
        Ok(self)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `IngestError::Config` describing the first problem found.
    pub fn validate(&self) -> IngestResult<()> {
        let url = self.api.management_url.trim();
        if url.is_empty() {
            return Err(config_err("management_url is required"));
        }
        let parsed = url::Url::parse(url)
            .map_err(|e| config_err(format!("management_url '{url}' is invalid: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(config_err("management_url must use http or https"));
        }
        if self.api.api_token.is_empty() {
            return Err(config_err("api_token is required"));
        }
        if self.api.api_version.trim().is_empty() {
            return Err(config_err("api_version cannot be empty"));
        }
        check_positive_secs("api.request_timeout_secs", self.api.request_timeout_secs)?;

        if self.paging.page_limit == 0
            || self.paging.note_page_limit == 0
            || self.paging.indicator_page_limit == 0
        {
            return Err(config_err("page limits must be at least 1"));
        }
        if self.workers.max_workers == 0 {
            return Err(config_err("max_workers must be at least 1"));
        }
        if self.init.max_init_retry == 0 {
            return Err(config_err("max_init_retry must be at least 1"));
        }

        let lb = &self.lookback;
        if lb.max_days == 0 || lb.max_incident_days == 0 || lb.max_deep_visibility_days == 0 {
            return Err(config_err("lookback maxima must be at least 1 day"));
        }
        if lb.default_days > lb.max_days.min(lb.max_incident_days) {
            return Err(config_err(format!(
                "default lookback of {} days exceeds the {}-day maximum",
                lb.default_days,
                lb.max_days.min(lb.max_incident_days)
            )));
        }

        let dv = &self.deep_visibility;
        check_positive_secs("deep_visibility.timeout_secs", dv.timeout_secs)?;
        if dv.window_before_secs < 0 || dv.window_after_secs < 0 {
            return Err(config_err("deep-visibility window offsets cannot be negative"));
        }
        if dv.sort_field.trim().is_empty() {
            return Err(config_err("deep_visibility.sort_field cannot be empty"));
        }
        if dv.result_limit == 0 {
            return Err(config_err("deep_visibility.result_limit must be at least 1"));
        }

        for path in self.filter.whitelist.iter().chain(&self.filter.ignore_fields) {
            if path.split('.').any(str::is_empty) {
                return Err(config_err(format!("field path '{path}' has an empty segment")));
            }
        }

        for (name, template) in [
            ("endpoints.notes", &self.endpoints.notes),
            ("endpoints.indicators", &self.endpoints.indicators),
        ] {
            if !template.contains("{id}") {
                return Err(config_err(format!("{name} must contain an {{id}} placeholder")));
            }
        }
        for (name, path) in [
            ("endpoints.incidents", &self.endpoints.incidents),
            ("endpoints.power_query", &self.endpoints.power_query),
            ("endpoints.power_query_ping", &self.endpoints.power_query_ping),
        ] {
            if path.trim().is_empty() {
                return Err(config_err(format!("{name} cannot be empty")));
            }
        }

        if let Some(rps) = self.requests_per_second {
            if !rps.is_finite() || rps <= 0.0 {
                return Err(config_err("requests_per_second must be positive"));
            }
        }

        Ok(())
    }
}

fn config_err(message: impl Into<String>) -> IngestError {
    IngestError::Config(message.into())
}

fn check_positive_secs(name: &str, secs: f64) -> IngestResult<()> {
    if secs.is_finite() && secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok() {
        Ok(())
    } else {
        Err(config_err(format!("{name} must be a positive number of seconds")))
    }
}

fn secs_to_duration(secs: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(fallback)
}

fn parse_env<T>(name: &str, raw: &str) -> IngestResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| config_err(format!("{name}='{raw}': {e}")))
}

fn parse_bool(name: &str, raw: &str) -> IngestResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(config_err(format!("{name}='{raw}' is not a boolean"))),
    }
}
