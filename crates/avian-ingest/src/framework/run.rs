//! Single-source ingestion state machine
//!
//! ```text
//! INIT -> CONNECTING -> FETCHING -> LOADING -> CHECKPOINTING -> DONE
//!              \            \           \
//!               +------------+-----------+--> FAILED -> DONE
//! ```
//!
//! LOADING also publishes the source's side datasets when the fetch ran to
//! completion.
//!
//! [`IngestionRun::execute`] never returns an error: every failure is folded
//! into the returned [`RunMetadata`].

use crate::framework::checkpoint::{Checkpoint, CheckpointStore};
use crate::framework::clock::Clock;
use crate::framework::download::BulkDownloader;
use crate::framework::pipeline::{PipelineOutcome, RecordPipeline};
use crate::framework::source::Source;
use crate::framework::storage::{BatchFile, BatchStore};
use crate::framework::types::{FetchWindow, IngestionStatus, RunMetadata, StandardizedRecord};
use avian_common::types::parse_timestamp;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Rejection reasons kept per record
const REASONS_PER_RECORD: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Connecting,
    Fetching,
    Loading,
    Checkpointing,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Init => "init",
            RunState::Connecting => "connecting",
            RunState::Fetching => "fetching",
            RunState::Loading => "loading",
            RunState::Checkpointing => "checkpointing",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-controlled knobs for one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Explicit window start; wins over the checkpoint
    pub start: Option<DateTime<Utc>>,
    /// Window end; defaults to now
    pub end: Option<DateTime<Utc>>,
    pub incremental: bool,
    pub download_audio: bool,
    pub max_error_messages: usize,
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            incremental: true,
            download_audio: false,
            max_error_messages: 100,
            cancel: CancellationToken::new(),
        }
    }
}

/// Collaborators shared by every run
#[derive(Clone)]
pub struct RunEnvironment {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub batches: Arc<BatchStore>,
    pub clock: Arc<dyn Clock>,
    pub downloader: Option<Arc<BulkDownloader>>,
}

/// One invocation of one source
pub struct IngestionRun<'a> {
    source: &'a dyn Source,
    env: &'a RunEnvironment,
    options: RunOptions,
    state: RunState,
    metadata: RunMetadata,
}

impl<'a> IngestionRun<'a> {
    pub fn new(source: &'a dyn Source, env: &'a RunEnvironment, options: RunOptions) -> Self {
        let metadata = RunMetadata::new(source.id(), env.clock.now());
        Self {
            source,
            env,
            options,
            state: RunState::Init,
            metadata,
        }
    }

    /// Metadata for a source that is administratively disabled
    pub fn skipped(source_id: &str, now: DateTime<Utc>) -> RunMetadata {
        let mut metadata = RunMetadata::new(source_id, now);
        metadata.status = IngestionStatus::Skipped;
        metadata.completed_at = Some(now);
        metadata
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub async fn execute(self) -> RunMetadata {
        let span = info_span!(
            "ingest",
            source = %self.metadata.source_id,
            batch_id = %self.metadata.batch_id
        );
        self.drive().instrument(span).await
    }

    async fn drive(mut self) -> RunMetadata {
        info!("Starting ingestion run");

        self.transition(RunState::Connecting);
        if let Err(e) = self.source.connect().await {
            error!(error = %e, "Connectivity check failed");
            self.push_error(format!("Failed to connect to data source: {e}"));
            return self.fail();
        }

        self.transition(RunState::Fetching);
        let window = match self.resolve_window().await {
            Ok(window) => window,
            Err(e) => {
                self.push_error(format!("Failed to resolve fetch window: {e}"));
                return self.fail();
            },
        };
        self.metadata.window = Some(window);

        let fetched = if window.is_empty() {
            info!(start = %window.start, end = %window.end, "Empty fetch window, nothing to fetch");
            FetchResult::default()
        } else {
            self.fetch(window).await
        };

        self.transition(RunState::Loading);
        if !fetched.records.is_empty() {
            if let Err(e) = self.load(window, &fetched.records).await {
                error!(error = %e, "Failed to write batch");
                self.push_error(format!("Failed to write batch: {e}"));
                return self.fail();
            }
            if self.options.download_audio {
                self.download_audio(&fetched.records).await;
            }
        } else {
            debug!("No accepted records, nothing to load");
        }
        if !fetched.aborted && !window.is_empty() && !self.options.cancel.is_cancelled() {
            self.publish_datasets(window).await;
        }

        self.transition(RunState::Checkpointing);
        if self.options.incremental && !fetched.aborted {
            if let Some(max_ts) = fetched.max_timestamp {
                self.advance_checkpoint(max_ts).await;
            }
        }

        let status = derive_status(
            self.metadata.records_fetched,
            self.metadata.records_validated,
            self.metadata.records_failed,
            fetched.aborted,
        );
        self.finish(status)
    }

    async fn resolve_window(&self) -> crate::error::Result<FetchWindow> {
        let end = self.options.end.unwrap_or_else(|| self.env.clock.now());

        let start = if let Some(start) = self.options.start {
            start
        } else if let Some(checkpoint) = self.load_checkpoint().await? {
            checkpoint
        } else {
            end - self.source.default_lookback()
        };

        info!(start = %start, end = %end, "Resolved fetch window");
        Ok(FetchWindow::new(start, end))
    }

    async fn load_checkpoint(&self) -> crate::error::Result<Option<DateTime<Utc>>> {
        if !self.options.incremental {
            return Ok(None);
        }
        let checkpoint = self.env.checkpoints.load(self.source.id()).await?;
        Ok(checkpoint.map(|c| c.last_timestamp))
    }

    async fn fetch(&mut self, window: FetchWindow) -> FetchResult {
        let source = self.source;
        let pipeline = RecordPipeline::new(source, self.metadata.batch_id.clone(), self.metadata.started_at);
        let checkpoint_field = source.checkpoint_field();
        let mut result = FetchResult::default();

        let mut stream = source.fetch(window, self.options.cancel.clone());
        while let Some(item) = stream.next().await {
            let raw = match item {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(
                        fetched = self.metadata.records_fetched,
                        error = %e,
                        "Fetch aborted, keeping records processed so far"
                    );
                    let message = format!("Fetch aborted after {} records: {e}", self.metadata.records_fetched);
                    self.push_error(message);
                    result.aborted = true;
                    break;
                },
            };

            self.metadata.records_fetched += 1;
            match pipeline.process(raw) {
                PipelineOutcome::Accepted(record) => {
                    self.metadata.records_validated += 1;
                    let ts = record.str_field(checkpoint_field).and_then(parse_timestamp);
                    result.max_timestamp = result.max_timestamp.max(ts);
                    result.records.push(record);
                },
                PipelineOutcome::Rejected { record_id, reasons } => {
                    self.metadata.records_failed += 1;
                    for reason in reasons.iter().take(REASONS_PER_RECORD) {
                        self.push_error(format!("{record_id}: {reason}"));
                    }
                },
            }
        }

        info!(
            fetched = self.metadata.records_fetched,
            validated = self.metadata.records_validated,
            failed = self.metadata.records_failed,
            "Fetch complete"
        );
        result
    }

    async fn load(&mut self, window: FetchWindow, records: &[StandardizedRecord]) -> crate::error::Result<()> {
        let batch = BatchFile::new(
            self.source.id(),
            self.metadata.batch_id.clone(),
            self.metadata.started_at,
            records.to_vec(),
        );
        let receipt = self.env.batches.write(window.end.date_naive(), &batch).await?;
        self.metadata.batch_path = Some(receipt.path);
        Ok(())
    }

    async fn download_audio(&mut self, records: &[StandardizedRecord]) {
        let Some(downloader) = self.env.downloader.clone() else {
            warn!("Audio download requested but no downloader is configured");
            return;
        };
        let source = self.source;
        let assets: Vec<_> = records.iter().filter_map(|r| source.audio_asset(r)).collect();
        if assets.is_empty() {
            debug!("No audio assets for accepted records");
            return;
        }

        let summary = downloader.run(assets, self.options.cancel.clone()).await;
        for failure in &summary.failures {
            self.push_error(format!("Audio download failed: {failure}"));
        }
        self.metadata.downloads = Some(summary);
    }

    async fn publish_datasets(&mut self, window: FetchWindow) {
        let datasets = match self.source.datasets(window, self.options.cancel.clone()).await {
            Ok(datasets) => datasets,
            Err(e) => {
                warn!(error = %e, "Failed to fetch side datasets");
                self.push_error(format!("Failed to fetch datasets: {e}"));
                return;
            },
        };

        let partition = window.end.date_naive();
        for dataset in datasets {
            if dataset.rows.is_empty() {
                debug!(dataset = %dataset.name, "Empty dataset, not written");
                continue;
            }
            let written = self
                .env
                .batches
                .write_dataset(self.source.id(), partition, &self.metadata.batch_id, &dataset)
                .await;
            match written {
                Ok(receipt) => self.metadata.datasets.push(receipt.path),
                Err(e) => {
                    error!(dataset = %dataset.name, error = %e, "Failed to write dataset");
                    self.push_error(format!("Failed to write dataset {}: {e}", dataset.name));
                },
            }
        }
    }

    async fn advance_checkpoint(&mut self, max_ts: DateTime<Utc>) {
        let candidate = Checkpoint::new(self.source.id(), max_ts, self.env.clock.now());
        match self.env.checkpoints.save(candidate).await {
            Ok(effective) => self.metadata.checkpoint = Some(effective.last_timestamp),
            Err(e) => {
                // records are already on disk; the next run re-fetches the overlap
                error!(error = %e, "Failed to save checkpoint");
                self.push_error(format!("Failed to save checkpoint: {e}"));
            },
        }
    }

    fn push_error(&mut self, message: String) {
        self.metadata.push_error(message, self.options.max_error_messages);
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = %self.state, to = %next, "Run state transition");
        self.state = next;
    }

    fn fail(mut self) -> RunMetadata {
        self.transition(RunState::Failed);
        self.finish(IngestionStatus::Failed)
    }

    fn finish(mut self, status: IngestionStatus) -> RunMetadata {
        self.transition(RunState::Done);
        self.metadata.status = status;
        self.metadata.completed_at = Some(self.env.clock.now());
        info!(
            status = %status,
            fetched = self.metadata.records_fetched,
            validated = self.metadata.records_validated,
            failed = self.metadata.records_failed,
            "Ingestion run finished"
        );
        self.metadata
    }
}

#[derive(Default)]
struct FetchResult {
    records: Vec<StandardizedRecord>,
    max_timestamp: Option<DateTime<Utc>>,
    aborted: bool,
}

/// Status of a run that got past connecting and loading
pub fn derive_status(fetched: u64, validated: u64, failed: u64, aborted: bool) -> IngestionStatus {
    if aborted {
        return if validated > 0 {
            IngestionStatus::Partial
        } else {
            IngestionStatus::Failed
        };
    }
    if validated > 0 && failed > 0 {
        IngestionStatus::Partial
    } else if fetched > 0 && validated == 0 {
        IngestionStatus::Failed
    } else {
        IngestionStatus::Success
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_status() {
        assert_eq!(derive_status(0, 0, 0, false), IngestionStatus::Success);
        assert_eq!(derive_status(10, 10, 0, false), IngestionStatus::Success);
        assert_eq!(derive_status(10, 7, 3, false), IngestionStatus::Partial);
        assert_eq!(derive_status(4, 0, 4, false), IngestionStatus::Failed);
        assert_eq!(derive_status(5, 5, 0, true), IngestionStatus::Partial);
        assert_eq!(derive_status(0, 0, 0, true), IngestionStatus::Failed);
        assert_eq!(derive_status(3, 0, 3, true), IngestionStatus::Failed);
    }

    #[test]
    fn test_skipped_metadata() {
        let now = Utc::now();
        let metadata = IngestionRun::skipped("knmi_weather", now);
        assert_eq!(metadata.status, IngestionStatus::Skipped);
        assert!(metadata.is_complete());
        assert_eq!(metadata.records_fetched, 0);
    }

    #[test]
    fn test_default_options_are_incremental() {
        let options = RunOptions::default();
        assert!(options.incremental);
        assert!(!options.download_audio);
        assert_eq!(options.max_error_messages, 100);
    }
}
