//! Runs one or more sources against shared stores
//!
//! Sources run sequentially by default. With `pipeline.parallel_ingestion`
//! every selected source runs at once; results always come back in the
//! order the sources were requested.

use crate::config::Settings;
use crate::error::Result;
use crate::framework::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::framework::clock::{Clock, SystemClock};
use crate::framework::download::BulkDownloader;
use crate::framework::run::{IngestionRun, RunEnvironment, RunOptions};
use crate::framework::storage::BatchStore;
use crate::framework::transport::HttpClient;
use crate::framework::types::{IngestionStatus, RunMetadata};
use crate::sources::SourceKind;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

pub struct IngestOrchestrator {
    settings: Settings,
    env: RunEnvironment,
    download_http: Arc<HttpClient>,
}

impl IngestOrchestrator {
    /// Wire file-backed stores under the configured data path
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: Settings, clock: Arc<dyn Clock>) -> Result<Self> {
        let download_http = Arc::new(HttpClient::new(&settings.retry.http_config(None), clock.clone())?);
        let downloader = BulkDownloader::new(download_http.clone(), settings.pipeline.download_workers);
        let env = RunEnvironment {
            checkpoints: Arc::new(FileCheckpointStore::new(settings.storage.checkpoint_dir())),
            batches: Arc::new(BatchStore::new(settings.storage.bronze_dir())),
            clock,
            downloader: Some(Arc::new(downloader)),
        };
        Ok(Self {
            settings,
            env,
            download_http,
        })
    }

    /// Show a progress bar while downloading audio
    pub fn with_progress(mut self, progress: bool) -> Self {
        let downloader = BulkDownloader::new(self.download_http.clone(), self.settings.pipeline.download_workers)
            .with_progress(progress);
        self.env.downloader = Some(Arc::new(downloader));
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn checkpoints(&self) -> Arc<dyn CheckpointStore> {
        self.env.checkpoints.clone()
    }

    pub fn batches(&self) -> Arc<BatchStore> {
        self.env.batches.clone()
    }

    /// Run `kinds` and return one metadata entry per requested source
    pub async fn run_sources(&self, kinds: &[SourceKind], options: RunOptions) -> Vec<RunMetadata> {
        let started = Instant::now();
        let concurrency = if self.settings.pipeline.parallel_ingestion {
            kinds.len().max(1)
        } else {
            1
        };
        info!(sources = kinds.len(), concurrency, "Starting ingestion");

        let runs: Vec<RunMetadata> = stream::iter(kinds.iter().copied())
            .map(|kind| self.run_one(kind, options.clone()))
            .buffered(concurrency)
            .collect()
            .await;

        let summary = IngestSummary::from_runs(&runs);
        info!(
            sources = summary.sources,
            succeeded = summary.succeeded,
            partial = summary.partial,
            failed = summary.failed,
            skipped = summary.skipped,
            records = summary.records_validated,
            duration_secs = started.elapsed().as_secs_f64(),
            "Ingestion finished"
        );
        runs
    }

    async fn run_one(&self, kind: SourceKind, mut options: RunOptions) -> RunMetadata {
        let now = self.env.clock.now();
        if !kind.enabled(&self.settings) {
            info!(source = %kind, "Source disabled, skipping");
            return IngestionRun::skipped(kind.as_str(), now);
        }

        let source = match kind.build(&self.settings, self.env.clock.clone()) {
            Ok(source) => source,
            Err(e) => {
                error!(source = %kind, error = %e, "Failed to construct source");
                let mut metadata = RunMetadata::new(kind.as_str(), now);
                metadata.push_error(format!("Failed to construct source: {e}"), self.settings.pipeline.max_error_messages);
                metadata.completed_at = Some(now);
                return metadata;
            },
        };

        options.incremental = options.incremental && self.settings.pipeline.incremental;
        options.download_audio = options.download_audio || kind.downloads_audio_by_default(&self.settings);
        options.max_error_messages = self.settings.pipeline.max_error_messages;

        IngestionRun::new(source.as_ref(), &self.env, options).execute().await
    }
}

/// Totals across the runs of one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub sources: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
    pub records_fetched: u64,
    pub records_validated: u64,
    pub records_failed: u64,
}

impl IngestSummary {
    pub fn from_runs(runs: &[RunMetadata]) -> Self {
        runs.iter().fold(Self::default(), |mut summary, run| {
            summary.sources += 1;
            match run.status {
                IngestionStatus::Success => summary.succeeded += 1,
                IngestionStatus::Partial => summary.partial += 1,
                IngestionStatus::Failed => summary.failed += 1,
                IngestionStatus::Skipped => summary.skipped += 1,
            }
            summary.records_fetched += run.records_fetched;
            summary.records_validated += run.records_validated;
            summary.records_failed += run.records_failed;
            summary
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.storage.base_path = dir.path().join("data");
        settings.knmi.input_path = dir.path().join("knmi");
        settings.mortality.input_path = dir.path().join("mortality");
        settings
    }

    #[test]
    fn test_summary_counts_statuses() {
        let now = Utc::now();
        let mut ok = RunMetadata::new("a", now);
        ok.status = IngestionStatus::Success;
        ok.records_fetched = 10;
        ok.records_validated = 10;
        let mut partial = RunMetadata::new("b", now);
        partial.status = IngestionStatus::Partial;
        partial.records_fetched = 5;
        partial.records_validated = 3;
        partial.records_failed = 2;
        let skipped = IngestionRun::skipped("c", now);

        let summary = IngestSummary::from_runs(&[ok, partial, skipped]);
        assert_eq!(summary.sources, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.partial, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.records_fetched, 15);
        assert_eq!(summary.records_failed, 2);
    }

    #[tokio::test]
    async fn test_disabled_sources_are_skipped_in_order() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(&dir);
        settings.birdweather.enabled = false;
        settings.xeno_canto.enabled = false;

        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 8, 15, 0, 0, 0).unwrap()));
        let orchestrator = IngestOrchestrator::with_clock(settings, clock).unwrap();
        let runs = orchestrator
            .run_sources(
                &[SourceKind::BirdWeather, SourceKind::Knmi, SourceKind::XenoCanto],
                RunOptions::default(),
            )
            .await;

        let statuses: Vec<_> = runs.iter().map(|r| (r.source_id.as_str(), r.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("birdweather", IngestionStatus::Skipped),
                ("knmi_weather", IngestionStatus::Success),
                ("xeno_canto", IngestionStatus::Skipped),
            ]
        );
        // the missing input directory is created on connect
        assert!(dir.path().join("knmi").is_dir());
    }

    #[tokio::test]
    async fn test_parallel_runs_keep_request_order() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(&dir);
        settings.pipeline.parallel_ingestion = true;

        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 8, 15, 0, 0, 0).unwrap()));
        let orchestrator = IngestOrchestrator::with_clock(settings, clock).unwrap();
        let runs = orchestrator
            .run_sources(&[SourceKind::Mortality, SourceKind::Knmi], RunOptions::default())
            .await;

        assert_eq!(runs[0].source_id, "mortality_surveillance");
        assert_eq!(runs[1].source_id, "knmi_weather");
        assert!(runs.iter().all(|r| r.status == IngestionStatus::Success));
        assert!(runs.iter().all(|r| r.batch_path.is_none()));
    }
}
