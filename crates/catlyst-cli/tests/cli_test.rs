//! Integration tests for the `catlyst` binary.

use std::path::Path;

use assert_cmd::Command;
use chrono::{Duration, Utc};
use predicates::prelude::*;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const S1_VARS: &[&str] = &[
    "S1_MANAGEMENT_URL",
    "S1_API_TOKEN",
    "S1_API_VERSION",
    "S1_VERIFY_SSL",
    "S1_PAGE_LIMIT",
    "S1_NOTE_PAGE",
    "S1_MAX_WORKERS",
    "S1_DV_TIMEOUT",
    "S1_MAX_INIT_RETRY",
    "S1_LOOKBACK_DAYS",
    "S1_MAX_INCIDENT_LOOKBACK_DAYS",
    "S1_MAX_DEEPVIS_LOOKBACK_DAYS",
];

/// Get the `catlyst` command with a clean `S1_*` environment.
fn catlyst_cmd() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_catlyst"));
    // Suppress tracing output during tests
    cmd.env("RUST_LOG", "error");
    for var in S1_VARS {
        cmd.env_remove(var);
    }
    cmd
}

fn write_config(dir: &Path, url: &str) -> std::path::PathBuf {
    let path = dir.join("catlyst.toml");
    let body = format!(
        r#"
[api]
management_url = "{url}"
api_token = "cli-token"

[retry]
max_retries = 1
base_backoff_ms = 1
max_backoff_ms = 2
jitter = false

[init]
max_init_retry = 2
base_backoff_ms = 1
max_backoff_ms = 2

[filter]
whitelist = []
"#
    );
    std::fs::write(&path, body).expect("write config");
    path
}

#[test]
fn missing_management_url_fails_before_network() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.json");
    catlyst_cmd()
        .env("S1_API_TOKEN", "t")
        .arg("--output")
        .arg(&output)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("management_url is required"));
    assert!(!output.exists());
}

#[test]
fn missing_token_fails() {
    catlyst_cmd()
        .env("S1_MANAGEMENT_URL", "https://console.example.net")
        .assert()
        .failure()
        .stderr(predicate::str::contains("api_token is required"));
}

#[test]
fn oversized_lookback_is_rejected() {
    // Nothing listens on the discard port; validation must fire first.
    catlyst_cmd()
        .env("S1_MANAGEMENT_URL", "http://127.0.0.1:9")
        .env("S1_API_TOKEN", "t")
        .args(["--since-days", "400"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("400 days exceeds the"));
}

#[test]
fn rejects_malformed_until() {
    catlyst_cmd()
        .args(["--until", "last tuesday"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--until"));
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_auth_check_exits_nonzero() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/web/api/v2.1/system/status"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(dir.path(), &server.uri());
    let output = dir.path().join("out.json");

    catlyst_cmd()
        .arg("--config")
        .arg(&config)
        .arg("--output")
        .arg(&output)
        .assert()
        .failure()
        .stderr(predicate::str::contains("initialization failed after 2 attempts"));
    assert!(!output.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn run_exports_every_listed_incident() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/web/api/v2.1/system/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .mount(&server)
        .await;
    let created = (Utc::now() - Duration::hours(1)).to_rfc3339();
    Mock::given(method("GET"))
        .and(path("/web/api/v2.1/threats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": "T1", "threatInfo": {"threatId": "T1", "createdAt": created, "storyline": "s1"}},
                {"id": "T2", "threatInfo": {"threatId": "T2", "createdAt": created}}
            ],
            "pagination": {"nextCursor": null, "totalItems": 2}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/web/api/v2.1/threats/T1/notes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"text": "triaged"}]})))
        .mount(&server)
        .await;
    // Everything else (indicators, T2 notes, power-query) answers 404.

    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(dir.path(), &server.uri());
    let output = dir.path().join("reports/threats.json");

    catlyst_cmd()
        .arg("--config")
        .arg(&config)
        .arg("--output")
        .arg(&output)
        .args(["--workers", "2"])
        .assert()
        .success();

    let written: Value =
        serde_json::from_slice(&std::fs::read(&output).expect("export file")).expect("json");
    assert_eq!(written["metadata"]["num_threats"], 2);
    assert_eq!(written["threats"][0]["threatInfo"]["threatId"], "T1");
    assert_eq!(written["threats"][0]["notes"], json!(["triaged"]));
    assert_eq!(written["threats"][1]["threatInfo"]["threatId"], "T2");
    assert_eq!(written["enrichment"][0]["status"], "partial");
    assert_eq!(written["enrichment"][1]["status"], "failed");
    assert_eq!(written["enrichment"][1]["deep_visibility"]["status"], "skipped");
}
