//! Xeno-canto numbered paging against a mock server
//!
//! Each target species is its own query; pages follow `numPages`, and both
//! pages and species are paced by `page_delay_ms`.

use avian_ingest::config::XenoCantoConfig;
use avian_ingest::error::IngestError;
use avian_ingest::framework::{FetchWindow, HttpClient, HttpConfig, ManualClock, RetryPolicy, Source};
use avian_ingest::sources::XenoCantoSource;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

const BLACKBIRD: &str = "Turdus merula cnt:Netherlands q:A";
const SONG_THRUSH: &str = "Turdus philomelos cnt:Netherlands q:A";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 8, 15, 0, 0, 0).unwrap()
}

fn window() -> FetchWindow {
    FetchWindow::new(now() - chrono::Duration::days(30), now())
}

fn source(server: &MockServer, clock: Arc<ManualClock>) -> XenoCantoSource {
    let config = XenoCantoConfig {
        api_url: format!("{}/api/2/recordings", server.uri()),
        target_species: vec!["Turdus merula".into(), "Turdus philomelos".into()],
        page_delay_ms: 250,
        ..XenoCantoConfig::default()
    };
    let http_config = HttpConfig {
        retry: RetryPolicy::new(2, Duration::from_secs(1)),
        ..HttpConfig::default()
    };
    let http = Arc::new(HttpClient::new(&http_config, clock.clone()).unwrap());
    XenoCantoSource::new(config, http, clock, std::env::temp_dir().join("xeno-canto-audio"))
}

fn recording(id: &str, uploaded: &str) -> Value {
    json!({
        "id": id,
        "gen": "Turdus",
        "sp": "merula",
        "en": "Eurasian Blackbird",
        "cnt": "Netherlands",
        "lat": "52.09",
        "lng": "5.12",
        "q": "A",
        "file": format!("//xeno-canto.org/{id}/download"),
        "uploaded": uploaded
    })
}

fn page(num_pages: u32, recordings: Vec<Value>) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "numRecordings": "3",
        "numPages": num_pages,
        "recordings": recordings
    }))
}

async fn serve_page(server: &MockServer, query: &str, number: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/api/2/recordings"))
        .and(query_param("query", query))
        .and(query_param("page", number))
        .respond_with(response)
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_pages_and_species_are_paced() {
    let server = MockServer::start().await;
    serve_page(
        &server,
        BLACKBIRD,
        "1",
        page(2, vec![recording("101", "2024-08-10"), recording("102", "2024-06-01")]),
    )
    .await;
    serve_page(&server, BLACKBIRD, "2", page(2, vec![recording("103", "2024-08-15")])).await;
    serve_page(&server, SONG_THRUSH, "1", page(1, vec![recording("201", "2024-07-20")])).await;

    let clock = Arc::new(ManualClock::new(now()));
    let source = source(&server, clock.clone());

    let records: Vec<_> = source.fetch(window(), CancellationToken::new()).collect().await;

    let ids: Vec<String> = records
        .into_iter()
        .map(|r| r.unwrap().record_id)
        .collect();
    // 102 was uploaded before the window; 103 on its end day
    assert_eq!(ids, vec!["101", "103", "201"]);

    // one pause before blackbird page 2, one before the second species
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(250), Duration::from_millis(250)]
    );
}

#[tokio::test]
async fn test_recordings_carry_queried_species() {
    let server = MockServer::start().await;
    serve_page(&server, BLACKBIRD, "1", page(1, vec![recording("101", "2024-08-10")])).await;
    serve_page(&server, SONG_THRUSH, "1", page(1, Vec::new())).await;

    let clock = Arc::new(ManualClock::new(now()));
    let records: Vec<_> = source(&server, clock)
        .fetch(window(), CancellationToken::new())
        .collect()
        .await;

    assert_eq!(records.len(), 1);
    let record = records[0].as_ref().unwrap();
    assert_eq!(record.source_system, "xeno_canto");
    assert_eq!(record.str_field("_species_queried"), Some("Turdus merula"));
}

#[tokio::test]
async fn test_cancelled_token_sends_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(page(1, vec![recording("101", "2024-08-10")]))
        .expect(0)
        .mount(&server)
        .await;

    let clock = Arc::new(ManualClock::new(now()));
    let source = source(&server, clock.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let records: Vec<_> = source.fetch(window(), cancel).collect().await;

    assert_eq!(records.len(), 1);
    assert!(matches!(records[0], Err(IngestError::Cancelled)));
    assert!(clock.sleeps().is_empty());
}
