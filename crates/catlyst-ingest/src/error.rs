//! Ingestion error types.

use std::time::Duration;

use thiserror::Error;

use crate::retry::{RetryDecision, classify_status};

/// Errors raised by the ingestion engine.
#[derive(Error, Debug)]
pub enum IngestError {
    /// HTTP request failed before a response was received
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Management API returned a non-success status
    #[error("API error {status}: {message}")]
    Api {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    /// A retryable error persisted past the retry ceiling
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<IngestError>,
    },

    /// Response body did not have the expected shape
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Deep-visibility power-query reported failure
    #[error("power-query {query_id} failed: {message}")]
    QueryFailed { query_id: String, message: String },

    /// Session/auth could not be established
    #[error("initialization failed after {attempts} attempts: {last}")]
    InitExhausted {
        attempts: u32,
        last: Box<IngestError>,
    },

    /// Fetch window rejected before any network call
    #[error("invalid fetch window: {0}")]
    InvalidWindow(String),

    /// Configuration rejected
    #[error("configuration error: {0}")]
    Config(String),

    /// Primary listing stopped early
    #[error("listing failed after {pages} pages ({items} items): {source}")]
    Listing {
        pages: u32,
        items: usize,
        source: Box<IngestError>,
    },
}

impl IngestError {
    /// Classify this error for the retry loop.
    #[must_use]
    pub fn retry_decision(&self) -> RetryDecision {
        match self {
            Self::Http(e) => {
                if let Some(status) = e.status() {
                    classify_status(status.as_u16(), None)
                } else if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
                    RetryDecision::Backoff
                } else {
                    RetryDecision::Terminal
                }
            }
            Self::Api {
                status,
                retry_after,
                ..
            } => classify_status(*status, *retry_after),
            _ => RetryDecision::Terminal,
        }
    }

    /// Check if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retry_decision().is_retryable()
    }

    /// HTTP status that triggered this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::Api { status, .. } => Some(*status),
            Self::RetryExhausted { last, .. }
            | Self::InitExhausted { last, .. }
            | Self::Listing { source: last, .. } => last.status(),
            _ => None,
        }
    }
}

/// Result type for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;
