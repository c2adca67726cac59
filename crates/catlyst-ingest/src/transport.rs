//! Rate-limited, retrying transport for the management API.
//!
//! [`ApiTransport::execute_once`] performs exactly one call and classifies
//! its failure as an [`IngestError`]; [`execute_with_retry`] is the single
//! backoff loop that consumes those classifications. [`HttpTransport`] is the
//! reqwest-backed implementation used in production.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, RETRY_AFTER};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::config::{ApiToken, IngestConfig};
use crate::error::{IngestError, IngestResult};
use crate::pacer::RequestPacer;
use crate::retry::{BackoffSchedule, parse_retry_after};

const MAX_ERROR_BODY_CHARS: usize = 512;

/// HTTP method used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
        })
    }
}

/// One API call: method, path relative to the API prefix, query, JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    /// Append a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Replace a query parameter, appending it if absent.
    pub fn set_query(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(slot) = self.query.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.query.push((key.to_string(), value));
        }
    }

    /// First value of a query parameter.
    #[must_use]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Executes API requests.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// Perform a single attempt with no retry.
    async fn execute_once(&self, request: &ApiRequest) -> IngestResult<Value>;

    /// Perform the request, retrying transient failures.
    ///
    /// The default performs a single attempt.
    async fn execute(&self, request: &ApiRequest) -> IngestResult<Value> {
        self.execute_once(request).await
    }
}

/// Drive `execute_once` through `policy` until success, a terminal error,
/// or the attempt ceiling.
///
/// # Errors
/// Terminal errors are returned as-is; a retryable error that outlives the
/// policy is wrapped in `IngestError::RetryExhausted`.
pub async fn execute_with_retry<T>(
    transport: &T,
    policy: &BackoffSchedule,
    request: &ApiRequest,
) -> IngestResult<Value>
where
    T: ApiTransport + ?Sized,
{
    let mut attempt: u32 = 0;
    loop {
        let err = match transport.execute_once(request).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let decision = err.retry_decision();
        if !decision.is_retryable() {
            return Err(err);
        }

        let Some(delay) = policy.delay(attempt, decision, rand::random()) else {
            warn!(
                method = %request.method,
                path = %request.path,
                attempts = attempt + 1,
                error = %err,
                "retries exhausted"
            );
            return Err(IngestError::RetryExhausted {
                attempts: attempt + 1,
                last: Box::new(err),
            });
        };

        warn!(
            method = %request.method,
            path = %request.path,
            attempt,
            status = err.status(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "transient failure, retrying"
        );
        sleep(delay).await;
        attempt += 1;
    }
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
    prefix: String,
    token: ApiToken,
    policy: BackoffSchedule,
    pacer: Option<Arc<RequestPacer>>,
    auth_check_path: String,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("prefix", &self.prefix)
            .field("token", &self.token)
            .field("policy", &self.policy)
            .field("paced", &self.pacer.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Build a transport from configuration.
    ///
    /// # Errors
    /// Returns `IngestError::Http` if the client cannot be built.
    pub fn new(config: &IngestConfig) -> IngestResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.api.request_timeout())
            .danger_accept_invalid_certs(!config.api.verify_ssl)
            .pool_max_idle_per_host(config.workers.max_workers)
            .build()?;

        if !config.api.verify_ssl {
            warn!("TLS certificate verification is disabled");
        }

        let burst = u32::try_from(config.workers.max_workers).unwrap_or(u32::MAX);
        let pacer = config
            .requests_per_second
            .and_then(|rps| RequestPacer::new(rps, burst.min(10)))
            .map(Arc::new);

        Ok(Self {
            client,
            prefix: config.api.api_prefix(),
            token: config.api.api_token.clone(),
            policy: BackoffSchedule::from(&config.retry),
            pacer,
            auth_check_path: config.api.auth_check_path.clone(),
        })
    }

    /// Path probed by the initialization guard.
    #[must_use]
    pub fn auth_check_path(&self) -> &str {
        &self.auth_check_path
    }

    fn url(&self, path: &str) -> IngestResult<url::Url> {
        let raw = format!("{}/{}", self.prefix, path.trim_start_matches('/'));
        url::Url::parse(&raw).map_err(|e| IngestError::Config(format!("invalid URL '{raw}': {e}")))
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn execute_once(&self, request: &ApiRequest) -> IngestResult<Value> {
        if let Some(pacer) = &self.pacer {
            pacer.acquire().await;
        }

        let url = self.url(&request.path)?;
        let builder = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
        };
        let mut builder = builder
            .header(AUTHORIZATION, format!("ApiToken {}", self.token.expose()))
            .header(ACCEPT, "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "non-success response");
            return Err(IngestError::Api {
                status: status.as_u16(),
                message: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                retry_after,
            });
        }

        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn execute(&self, request: &ApiRequest) -> IngestResult<Value> {
        execute_with_retry(self, &self.policy, request).await
    }
}
