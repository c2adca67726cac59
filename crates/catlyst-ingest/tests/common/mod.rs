//! Shared fixtures for integration tests against a wiremock console.

#![allow(dead_code)]

use catlyst_ingest::{ApiToken, IngestConfig};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use wiremock::MockServer;

pub const TOKEN: &str = "test-token";
pub const PREFIX: &str = "/web/api/v2.1";

/// Config pointed at `server` with fast retries and no whitelist.
pub fn config_for(server: &MockServer) -> IngestConfig {
    let mut config = IngestConfig::default();
    config.api.management_url = server.uri();
    config.api.api_token = ApiToken::new(TOKEN);
    config.api.request_timeout_secs = 5.0;
    config.retry.max_retries = 3;
    config.retry.base_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.retry.jitter = false;
    config.init.base_backoff_ms = 1;
    config.init.max_backoff_ms = 5;
    config.deep_visibility.poll_interval_ms = 20;
    config.deep_visibility.timeout_secs = 5.0;
    config.workers.max_workers = 8;
    config.filter.whitelist = Vec::new();
    config
}

pub fn api_path(rest: &str) -> String {
    format!("{PREFIX}/{rest}")
}

pub fn incident(id: &str, created_at: DateTime<Utc>) -> Value {
    json!({
        "id": id,
        "threatInfo": {
            "threatId": id,
            "createdAt": created_at.to_rfc3339(),
            "analystVerdict": "true_positive",
            "storyline": format!("story-{id}"),
            "sha1": format!("sha1-{id}"),
            "classification": "Malware"
        },
        "agentRealtimeInfo": {"agentUuid": format!("agent-{id}")},
        "agentDetectionInfo": {"siteId": format!("site-{id}"), "accountId": format!("acct-{id}")}
    })
}

pub fn page(items: Vec<Value>, next: Option<&str>) -> Value {
    json!({
        "data": items,
        "pagination": {"nextCursor": next, "totalItems": null}
    })
}
