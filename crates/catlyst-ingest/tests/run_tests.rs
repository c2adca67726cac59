//! End-to-end runs against a fake console.

mod common;

use std::sync::Arc;
use std::time::Duration;

use catlyst_ingest::{
    EnrichmentStatus, FetchWindow, IngestConfig, IngestError, Orchestrator, RunState,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{api_path, config_for, incident, page};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{method, path, path_regex, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_status(server: &MockServer, failures: u64) {
    if failures > 0 {
        Mock::given(method("GET"))
            .and(path(api_path("system/status")))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .up_to_n_times(failures)
            .mount(server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path(api_path("system/status")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"health": "ok"}})))
        .mount(server)
        .await;
}

async fn mount_sub_resources(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/web/api/v2\.1/threats/[^/]+/notes$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"text": "analyst looked", "createdAt": "2024-03-01T10:00:00Z"},
                {"text": "   "},
                {"body": "confirmed", "createdAt": "2024-03-01T11:00:00Z"}
            ],
            "pagination": {"nextCursor": null}
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/web/api/v2\.1/threats/[^/]+/indicators$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"category": "Persistence", "tactics": ["TA0003"]}]
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("dv/events/pq")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"queryId": "q", "status": "FINISHED", "data": [{"event.time": 1, "event.type": "Login"}]}
        })))
        .mount(server)
        .await;
}

async fn mount_listing(server: &MockServer, ids: &[&str], created: DateTime<Utc>) {
    let items = ids.iter().map(|id| incident(id, created)).collect();
    Mock::given(method("GET"))
        .and(path(api_path("threats")))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(items, None)))
        .mount(server)
        .await;
}

fn window() -> FetchWindow {
    FetchWindow::lookback(1, Utc::now(), vec!["true_positive".into()]).expect("window")
}

fn orchestrator(config: IngestConfig) -> Orchestrator {
    Orchestrator::from_config(Arc::new(config)).expect("orchestrator")
}

#[tokio::test]
async fn full_run_merges_and_whitelists() {
    let server = MockServer::start().await;
    mount_status(&server, 0).await;
    mount_sub_resources(&server).await;
    let created = Utc::now() - ChronoDuration::hours(2);
    Mock::given(method("GET"))
        .and(path(api_path("threats")))
        .and(query_param("analystVerdicts", "true_positive"))
        .and(query_param_is_missing("cursor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(vec![incident("A", created)], Some("next"))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(api_path("threats")))
        .and(query_param("cursor", "next"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(vec![incident("B", created)], None)))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config_for(&server);
    config.filter = catlyst_ingest::config::FilterConfig::default();
    let orch = orchestrator(config);
    let output = orch.run(&window()).await.expect("run");

    assert_eq!(orch.state(), RunState::Done);
    assert_eq!(output.summary.listed, 2);
    assert_eq!(output.summary.listing_pages, 2);
    assert_eq!(output.summary.complete, 2);
    assert_eq!(output.records.len(), 2);

    let record = &output.records[0].record;
    assert_eq!(record["threatInfo"]["threatId"], "A");
    assert_eq!(record["threatInfo"]["sha1"], "sha1-A");
    assert!(record["threatInfo"].get("classification").is_none());
    assert!(record.get("agentRealtimeInfo").is_none());
    assert_eq!(record["notes"], json!(["analyst looked", "confirmed"]));
    assert_eq!(record["indicators"], json!([{"category": "Persistence", "tactics": ["TA0003"]}]));
    assert_eq!(record["deepVisibilityEvents"], json!([{"event.time": 1, "event.type": "Login"}]));
}

#[tokio::test]
async fn slow_enrichment_does_not_reorder_output() {
    let server = MockServer::start().await;
    mount_status(&server, 0).await;
    Mock::given(method("GET"))
        .and(path(api_path("threats/I2/notes")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": [{"text": "slow"}]}))
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;
    mount_sub_resources(&server).await;
    mount_listing(&server, &["I1", "I2", "I3"], Utc::now() - ChronoDuration::hours(1)).await;

    let output = orchestrator(config_for(&server))
        .run(&window())
        .await
        .expect("run");

    let ids: Vec<&str> = output.records.iter().map(|r| r.incident_id.as_str()).collect();
    assert_eq!(ids, vec!["I1", "I2", "I3"]);
    assert_eq!(output.records[1].record["notes"], json!(["slow"]));
}

#[tokio::test]
async fn init_succeeds_after_max_minus_one_failures() {
    let server = MockServer::start().await;
    mount_status(&server, 4).await;
    mount_sub_resources(&server).await;
    mount_listing(&server, &["A"], Utc::now() - ChronoDuration::hours(1)).await;

    let mut config = config_for(&server);
    config.init.max_init_retry = 5;
    let orch = orchestrator(config);
    let output = orch.run(&window()).await.expect("run proceeds");
    assert_eq!(output.records.len(), 1);
    assert_eq!(orch.state(), RunState::Done);
}

#[tokio::test]
async fn init_fails_after_max_failures_without_listing() {
    let server = MockServer::start().await;
    mount_status(&server, 5).await;
    Mock::given(method("GET"))
        .and(path(api_path("threats")))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(vec![], None)))
        .expect(0)
        .mount(&server)
        .await;

    let mut config = config_for(&server);
    config.init.max_init_retry = 5;
    let orch = orchestrator(config);
    let err = orch.run(&window()).await.unwrap_err();

    assert!(matches!(err, IngestError::InitExhausted { attempts: 5, .. }));
    assert_eq!(err.status(), Some(401));
    assert_eq!(orch.state(), RunState::Failed);
}

#[tokio::test]
async fn deep_visibility_timeout_counts_as_partial() {
    let server = MockServer::start().await;
    mount_status(&server, 0).await;
    Mock::given(method("POST"))
        .and(path(api_path("dv/events/pq")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {"queryId": "q", "status": "FINISHED"}}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    mount_sub_resources(&server).await;
    mount_listing(&server, &["A", "B"], Utc::now() - ChronoDuration::hours(1)).await;

    let mut config = config_for(&server);
    config.deep_visibility.timeout_secs = 0.2;
    let output = orchestrator(config).run(&window()).await.expect("run");

    assert_eq!(output.records.len(), 2);
    assert!(output.records.iter().all(|r| r.enrichment.status == EnrichmentStatus::Partial));
    assert_eq!(output.records[0].record["deepVisibilityEvents"], json!([]));
    assert_eq!(output.records[0].record["notes"], json!(["analyst looked", "confirmed"]));
    assert_eq!(output.summary.partial, 2);
    assert_eq!(output.summary.deep_visibility_timeouts, 2);
    assert_eq!(output.summary.failed, 0);
}

#[tokio::test]
async fn tolerated_listing_failure_keeps_first_pages() {
    let server = MockServer::start().await;
    mount_status(&server, 0).await;
    mount_sub_resources(&server).await;
    let created = Utc::now() - ChronoDuration::hours(1);
    Mock::given(method("GET"))
        .and(path(api_path("threats")))
        .and(query_param_is_missing("cursor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(vec![incident("A", created)], Some("c1"))))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(api_path("threats")))
        .and(query_param("cursor", "c1"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut strict = config_for(&server);
    strict.retry.max_retries = 0;
    let err = orchestrator(strict.clone()).run(&window()).await.unwrap_err();
    assert!(matches!(err, IngestError::Listing { pages: 1, items: 1, .. }));

    let mut tolerant = strict;
    tolerant.paging.tolerate_partial_listing = true;
    let output = orchestrator(tolerant).run(&window()).await.expect("partial run");
    assert_eq!(output.records.len(), 1);
    assert!(output.summary.listing_error.is_some());
}
