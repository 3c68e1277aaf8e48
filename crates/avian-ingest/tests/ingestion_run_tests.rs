//! Integration tests for a single ingestion run
//!
//! A scripted source feeds records (and optionally a mid-stream failure)
//! through the full connect, fetch, load and checkpoint sequence.

use async_trait::async_trait;
use avian_ingest::error::{IngestError, Result, TransformError, TransportError};
use avian_ingest::framework::{
    BatchStore, Checkpoint, CheckpointStore, Dataset, Fields, FetchWindow, IngestionRun, IngestionStatus,
    ManualClock, MemoryCheckpointStore, RawRecord, Rule, RuleSet, RunEnvironment, RunOptions,
    Source, ValidatedRecord, ValidationOutcome,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SOURCE: &str = "scripted";

#[derive(Clone)]
enum Step {
    Record(String, Value),
    Fail(&'static str),
}

struct ScriptedSource {
    steps: Vec<Step>,
    connect_error: Option<String>,
    datasets: std::result::Result<Vec<Dataset>, &'static str>,
    fetch_calls: AtomicUsize,
    rules: RuleSet,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            connect_error: None,
            datasets: Ok(Vec::new()),
            fetch_calls: AtomicUsize::new(0),
            rules: RuleSet::new(vec![Rule::required("timestamp"), Rule::range("value", 0.0, 100.0)]),
        }
    }

    fn unreachable(reason: &str) -> Self {
        Self {
            connect_error: Some(reason.to_string()),
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl Source for ScriptedSource {
    fn id(&self) -> &str {
        SOURCE
    }

    fn default_lookback(&self) -> chrono::Duration {
        Duration::hours(24)
    }

    async fn connect(&self) -> Result<()> {
        match &self.connect_error {
            Some(reason) => Err(IngestError::connect(SOURCE, reason.clone())),
            None => Ok(()),
        }
    }

    fn fetch(&self, _window: FetchWindow, _cancel: CancellationToken) -> BoxStream<'_, Result<RawRecord>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        stream::iter(self.steps.clone().into_iter().map(|step| match step {
            Step::Record(id, data) => Ok(RawRecord::new(SOURCE, id, data, now())),
            Step::Fail(message) => Err(TransportError::terminal(message).into()),
        }))
        .boxed()
    }

    fn validate(&self, record: &RawRecord) -> ValidationOutcome {
        self.rules.evaluate(record, now())
    }

    fn transform(&self, record: &ValidatedRecord) -> std::result::Result<Fields, TransformError> {
        let raw = record.raw();
        let mut fields = Fields::new();
        fields.insert("id".into(), json!(raw.record_id));
        fields.insert("timestamp".into(), json!(raw.str_field("timestamp")));
        fields.insert("value".into(), json!(raw.f64_field("value")));
        Ok(fields)
    }

    async fn datasets(&self, _window: FetchWindow, _cancel: CancellationToken) -> Result<Vec<Dataset>> {
        self.datasets
            .clone()
            .map_err(|message| TransportError::terminal(message).into())
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 8, 15, 0, 0, 0).unwrap()
}

fn hour(h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 8, 14, h, 0, 0).unwrap()
}

fn record(id: usize, at: DateTime<Utc>, value: f64) -> Step {
    Step::Record(
        format!("r{id}"),
        json!({ "timestamp": at.to_rfc3339(), "value": value }),
    )
}

struct Harness {
    _dir: TempDir,
    env: RunEnvironment,
    checkpoints: Arc<MemoryCheckpointStore>,
}

impl Harness {
    fn new() -> Self {
        Self::with_checkpoints(MemoryCheckpointStore::new())
    }

    fn with_checkpoints(store: MemoryCheckpointStore) -> Self {
        let dir = TempDir::new().unwrap();
        let checkpoints = Arc::new(store);
        let env = RunEnvironment {
            checkpoints: checkpoints.clone(),
            batches: Arc::new(BatchStore::new(dir.path().join("bronze"))),
            clock: Arc::new(ManualClock::new(now())),
            downloader: None,
        };
        Self {
            _dir: dir,
            env,
            checkpoints,
        }
    }

    async fn run(&self, source: &ScriptedSource, options: RunOptions) -> avian_ingest::framework::RunMetadata {
        IngestionRun::new(source, &self.env, options).execute().await
    }

    async fn stored_checkpoint(&self) -> Option<DateTime<Utc>> {
        self.checkpoints
            .load(SOURCE)
            .await
            .unwrap()
            .map(|c| c.last_timestamp)
    }
}

#[tokio::test]
async fn test_mixed_batch_is_partial() {
    let harness = Harness::new();
    let steps: Vec<Step> = (0..10)
        .map(|i| {
            let value = if i % 3 == 2 { 250.0 } else { 10.0 };
            record(i, hour(i as u32), value)
        })
        .collect();
    let source = ScriptedSource::new(steps);

    let metadata = harness.run(&source, RunOptions::default()).await;

    assert_eq!(metadata.status, IngestionStatus::Partial);
    assert_eq!(metadata.records_fetched, 10);
    assert_eq!(metadata.records_validated, 7);
    assert_eq!(metadata.records_failed, 3);
    assert_eq!(metadata.error_messages.len(), 3);
    assert!(metadata.error_messages[0].starts_with("r2: value 250"));

    let batch = BatchStore::read(metadata.batch_path.as_ref().unwrap()).await.unwrap();
    assert_eq!(batch.record_count, 7);
    assert_eq!(batch.batch_id, metadata.batch_id);
    assert!(batch
        .records
        .iter()
        .all(|r| r.batch_id() == Some(metadata.batch_id.as_str())));

    // r8 was rejected; the newest accepted record is r9
    assert_eq!(harness.stored_checkpoint().await, Some(hour(9)));
    assert_eq!(metadata.checkpoint, Some(hour(9)));
}

#[tokio::test]
async fn test_clean_run_succeeds_and_uses_default_lookback() {
    let harness = Harness::new();
    let source = ScriptedSource::new(vec![record(0, hour(1), 1.0), record(1, hour(2), 2.0)]);

    let metadata = harness.run(&source, RunOptions::default()).await;

    assert_eq!(metadata.status, IngestionStatus::Success);
    let window = metadata.window.unwrap();
    assert_eq!(window.end, now());
    assert_eq!(window.start, now() - Duration::hours(24));
    assert!(metadata.batch_path.unwrap().ends_with(format!("2024-08-15/{}.json", metadata.batch_id)));
}

#[tokio::test]
async fn test_checkpoint_starts_the_next_window() {
    let stored = Checkpoint::new(SOURCE, hour(6), hour(6));
    let harness = Harness::with_checkpoints(MemoryCheckpointStore::with_checkpoint(stored));
    let source = ScriptedSource::new(vec![record(0, hour(9), 1.0)]);

    let metadata = harness.run(&source, RunOptions::default()).await;

    assert_eq!(metadata.window.unwrap().start, hour(6));
    assert_eq!(harness.stored_checkpoint().await, Some(hour(9)));
}

#[tokio::test]
async fn test_full_run_ignores_and_keeps_checkpoint() {
    let stored = Checkpoint::new(SOURCE, hour(6), hour(6));
    let harness = Harness::with_checkpoints(MemoryCheckpointStore::with_checkpoint(stored));
    let source = ScriptedSource::new(vec![record(0, hour(9), 1.0)]);
    let options = RunOptions {
        incremental: false,
        ..RunOptions::default()
    };

    let metadata = harness.run(&source, options).await;

    assert_eq!(metadata.window.unwrap().start, now() - Duration::hours(24));
    assert_eq!(metadata.checkpoint, None);
    assert_eq!(harness.stored_checkpoint().await, Some(hour(6)));
}

#[tokio::test]
async fn test_checkpoint_never_moves_backwards() {
    let stored = Checkpoint::new(SOURCE, hour(20), hour(20));
    let harness = Harness::with_checkpoints(MemoryCheckpointStore::with_checkpoint(stored));
    let source = ScriptedSource::new(vec![record(0, hour(3), 1.0)]);
    let options = RunOptions {
        start: Some(hour(0)),
        ..RunOptions::default()
    };

    let metadata = harness.run(&source, options).await;

    assert_eq!(metadata.status, IngestionStatus::Success);
    assert_eq!(metadata.checkpoint, Some(hour(20)));
    assert_eq!(harness.stored_checkpoint().await, Some(hour(20)));
}

#[tokio::test]
async fn test_empty_window_skips_fetch() {
    let harness = Harness::new();
    let source = ScriptedSource::new(vec![record(0, hour(1), 1.0)]);
    let options = RunOptions {
        start: Some(now()),
        end: Some(now()),
        ..RunOptions::default()
    };

    let metadata = harness.run(&source, options).await;

    assert_eq!(metadata.status, IngestionStatus::Success);
    assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 0);
    assert_eq!(metadata.records_fetched, 0);
    assert!(metadata.batch_path.is_none());
    assert_eq!(harness.stored_checkpoint().await, None);
}

#[tokio::test]
async fn test_connect_failure_fails_without_fetching() {
    let harness = Harness::new();
    let source = ScriptedSource::unreachable("DNS lookup failed");

    let metadata = harness.run(&source, RunOptions::default()).await;

    assert_eq!(metadata.status, IngestionStatus::Failed);
    assert!(metadata.is_complete());
    assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 0);
    assert!(metadata.window.is_none());
    assert!(metadata.error_messages[0].starts_with("Failed to connect to data source"));
    assert!(metadata.error_messages[0].contains("DNS lookup failed"));
}

#[tokio::test]
async fn test_abort_keeps_records_but_not_checkpoint() {
    let harness = Harness::new();
    let source = ScriptedSource::new(vec![
        record(0, hour(1), 1.0),
        record(1, hour(2), 2.0),
        record(2, hour(3), 3.0),
        Step::Fail("HTTP 500 after retries"),
        record(3, hour(4), 4.0),
    ]);

    let metadata = harness.run(&source, RunOptions::default()).await;

    assert_eq!(metadata.status, IngestionStatus::Partial);
    assert_eq!(metadata.records_fetched, 3);
    assert!(metadata
        .error_messages
        .iter()
        .any(|m| m.starts_with("Fetch aborted after 3 records")));

    let batch = BatchStore::read(metadata.batch_path.as_ref().unwrap()).await.unwrap();
    assert_eq!(batch.record_count, 3);
    assert_eq!(harness.stored_checkpoint().await, None);
}

#[tokio::test]
async fn test_abort_before_any_record_fails() {
    let harness = Harness::new();
    let source = ScriptedSource::new(vec![Step::Fail("HTTP 401 from upstream")]);

    let metadata = harness.run(&source, RunOptions::default()).await;

    assert_eq!(metadata.status, IngestionStatus::Failed);
    assert!(metadata.batch_path.is_none());
}

#[tokio::test]
async fn test_error_messages_are_capped() {
    let harness = Harness::new();
    let steps = (0..20).map(|i| record(i, hour(1), 500.0)).collect();
    let source = ScriptedSource::new(steps);
    let options = RunOptions {
        max_error_messages: 5,
        ..RunOptions::default()
    };

    let metadata = harness.run(&source, options).await;

    assert_eq!(metadata.status, IngestionStatus::Failed);
    assert_eq!(metadata.records_failed, 20);
    assert_eq!(metadata.error_messages.len(), 5);
    assert_eq!(metadata.errors_dropped(), 15);
}

#[tokio::test]
async fn test_datasets_land_next_to_batch() {
    let harness = Harness::new();
    let mut source = ScriptedSource::new(vec![record(0, hour(1), 1.0)]);
    source.datasets = Ok(vec![
        Dataset::new("lookup", vec![json!({"code": "eurbla"}), json!({"code": "sonthr1"})]),
        Dataset::new("empty", Vec::new()),
    ]);

    let metadata = harness.run(&source, RunOptions::default()).await;

    assert_eq!(metadata.status, IngestionStatus::Success);
    assert_eq!(metadata.datasets.len(), 1);
    let path = &metadata.datasets[0];
    assert_eq!(
        path.parent(),
        metadata.batch_path.as_ref().unwrap().parent()
    );
    assert!(path.ends_with(format!("2024-08-15/{}.lookup.jsonl", metadata.batch_id)));
    let lines = std::fs::read_to_string(path).unwrap();
    assert_eq!(lines.lines().count(), 2);
}

#[tokio::test]
async fn test_dataset_failure_is_reported_without_changing_status() {
    let harness = Harness::new();
    let mut source = ScriptedSource::new(vec![record(0, hour(1), 1.0)]);
    source.datasets = Err("counts query rejected");

    let metadata = harness.run(&source, RunOptions::default()).await;

    assert_eq!(metadata.status, IngestionStatus::Success);
    assert!(metadata.datasets.is_empty());
    assert!(metadata.error_messages[0].starts_with("Failed to fetch datasets"));
    assert_eq!(harness.stored_checkpoint().await, Some(hour(1)));
}

#[tokio::test]
async fn test_aborted_fetch_publishes_no_datasets() {
    let harness = Harness::new();
    let mut source = ScriptedSource::new(vec![record(0, hour(1), 1.0), Step::Fail("HTTP 500 after retries")]);
    source.datasets = Ok(vec![Dataset::new("lookup", vec![json!({"code": "eurbla"})])]);

    let metadata = harness.run(&source, RunOptions::default()).await;

    assert_eq!(metadata.status, IngestionStatus::Partial);
    assert!(metadata.datasets.is_empty());
}
