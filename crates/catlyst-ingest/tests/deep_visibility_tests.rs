//! Power-query submission, polling and timeout.

mod common;

use std::time::Duration;

use catlyst_ingest::fetch::DeepVisibilityFetcher;
use catlyst_ingest::{HttpTransport, Incident, IngestConfig, SubResourceStatus};
use chrono::{Duration as ChronoDuration, Utc};
use common::{api_path, config_for, incident};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher(config: &IngestConfig) -> DeepVisibilityFetcher {
    DeepVisibilityFetcher::new(config.deep_visibility.clone(), &config.endpoints)
}

fn recent_incident() -> Incident {
    Incident::from_json(incident("7", Utc::now() - ChronoDuration::hours(1))).expect("incident")
}

async fn mount_submit(server: &MockServer, status: &str) {
    Mock::given(method("POST"))
        .and(path(api_path("dv/events/pq")))
        .and(body_partial_json(json!({
            "query": "src.process.storyline.id == 'story-7' or (src.process.image.sha1 == 'sha1-7' and agent.uuid == 'agent-7') | columns event.time, event.type, event.category, severity | sort event.time",
            "siteIds": ["site-7"],
            "accountIds": ["acct-7"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"queryId": "q-7", "status": status}
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn polls_until_finished_and_zips_rows() {
    let server = MockServer::start().await;
    mount_submit(&server, "RUNNING").await;
    Mock::given(method("GET"))
        .and(path(api_path("dv/events/pq-ping")))
        .and(query_param("queryId", "q-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"queryId": "q-7", "progress": 40}
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(api_path("dv/events/pq-ping")))
        .and(query_param("queryId", "q-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "queryId": "q-7",
                "status": "FINISHED",
                "data": [
                    ["2024-03-01T12:00:02Z", "Process Creation", "Process", "LOW"],
                    ["2024-03-01T12:00:01Z", "File Creation", "File", ""]
                ]
            }
        })))
        .mount(&server)
        .await;

    let config = config_for(&server);
    let transport = HttpTransport::new(&config).expect("transport");
    let cutoff = Utc::now() - ChronoDuration::days(90);
    let fetched = fetcher(&config).fetch(&transport, &recent_incident(), cutoff).await;

    assert_eq!(fetched.status, SubResourceStatus::Fetched { count: 2 });
    let first = serde_json::to_value(&fetched.items[0]).expect("json");
    assert_eq!(
        first,
        json!({
            "event.time": "2024-03-01T12:00:01Z",
            "event.type": "File Creation",
            "event.category": "File"
        })
    );
}

#[tokio::test]
async fn failed_query_is_reported_not_raised() {
    let server = MockServer::start().await;
    mount_submit(&server, "RUNNING").await;
    Mock::given(method("GET"))
        .and(path(api_path("dv/events/pq-ping")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"status": "FAILED_CLIENT"}
        })))
        .mount(&server)
        .await;

    let config = config_for(&server);
    let transport = HttpTransport::new(&config).expect("transport");
    let cutoff = Utc::now() - ChronoDuration::days(90);
    let fetched = fetcher(&config).fetch(&transport, &recent_incident(), cutoff).await;

    assert!(fetched.items.is_empty());
    match fetched.status {
        SubResourceStatus::Failed { error } => assert!(error.contains("q-7"), "{error}"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn slow_query_times_out_as_partial() {
    let server = MockServer::start().await;
    mount_submit(&server, "RUNNING").await;
    Mock::given(method("GET"))
        .and(path(api_path("dv/events/pq-ping")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {"status": "FINISHED", "data": []}}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let mut config = config_for(&server);
    config.deep_visibility.timeout_secs = 0.3;
    let transport = HttpTransport::new(&config).expect("transport");
    let cutoff = Utc::now() - ChronoDuration::days(90);

    let started = std::time::Instant::now();
    let fetched = fetcher(&config).fetch(&transport, &recent_incident(), cutoff).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(fetched.items.is_empty());
    assert!(matches!(fetched.status, SubResourceStatus::TimedOut { after_ms } if after_ms >= 250));
}

#[tokio::test]
async fn old_incidents_skip_without_calling_api() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let config = config_for(&server);
    let transport = HttpTransport::new(&config).expect("transport");
    let cutoff = Utc::now() - ChronoDuration::days(90);
    let old = Incident::from_json(incident("7", Utc::now() - ChronoDuration::days(120))).expect("incident");

    let fetched = fetcher(&config).fetch(&transport, &old, cutoff).await;
    assert!(matches!(fetched.status, SubResourceStatus::Skipped { .. }));
}
