//! Bounded worker pool for audio file transfer
//!
//! Each worker owns one file from start to finish. Bodies stream into
//! `{target}.part` and are renamed onto the target only after the byte count
//! checks out, so a target path never holds a truncated file.

use crate::framework::transport::HttpClient;
use anyhow::{bail, Context};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Failure reasons kept in a summary
const MAX_SAMPLED_FAILURES: usize = 20;

/// A remote file and where it should land
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioAsset {
    pub url: String,
    pub target: PathBuf,
    pub expected_size: Option<u64>,
}

impl AudioAsset {
    pub fn new(url: impl Into<String>, target: impl Into<PathBuf>, expected_size: Option<u64>) -> Self {
        Self {
            url: url.into(),
            target: target.into(),
            expected_size,
        }
    }

    pub fn part_path(&self) -> PathBuf {
        let mut name = self.target.as_os_str().to_owned();
        name.push(".part");
        PathBuf::from(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { bytes: u64 },
    AlreadyExists,
    Failed { reason: String },
    Cancelled,
}

impl DownloadOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadOutcome::Downloaded { .. } => "downloaded",
            DownloadOutcome::AlreadyExists => "already_exists",
            DownloadOutcome::Failed { .. } => "failed",
            DownloadOutcome::Cancelled => "cancelled",
        }
    }
}

/// One entry on the results queue
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub asset: AudioAsset,
    pub outcome: DownloadOutcome,
}

/// Totals over one downloader invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSummary {
    pub downloaded: u64,
    pub already_exists: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub bytes: u64,
    pub failures: Vec<String>,
}

impl DownloadSummary {
    pub fn record(&mut self, report: &DownloadReport) {
        match &report.outcome {
            DownloadOutcome::Downloaded { bytes } => {
                self.downloaded += 1;
                self.bytes += bytes;
            },
            DownloadOutcome::AlreadyExists => self.already_exists += 1,
            DownloadOutcome::Failed { reason } => {
                self.record_failure(format!("{}: {}", report.asset.url, reason));
            },
            DownloadOutcome::Cancelled => self.cancelled += 1,
        }
    }

    fn record_failure(&mut self, message: String) {
        self.failed += 1;
        if self.failures.len() < MAX_SAMPLED_FAILURES {
            self.failures.push(message);
        }
    }

    pub fn total(&self) -> u64 {
        self.downloaded + self.already_exists + self.failed + self.cancelled
    }
}

/// Fans asset transfers out over a fixed number of workers
pub struct BulkDownloader {
    http: Arc<HttpClient>,
    workers: usize,
    progress: bool,
}

impl BulkDownloader {
    pub fn new(http: Arc<HttpClient>, workers: usize) -> Self {
        Self {
            http,
            workers: workers.max(1),
            progress: false,
        }
    }

    /// Draw a progress bar on stderr while running
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Transfer every asset; files not started before `cancel` fires are
    /// reported as cancelled
    pub async fn run(&self, assets: Vec<AudioAsset>, cancel: CancellationToken) -> DownloadSummary {
        let bar = self.progress_bar(assets.len() as u64);
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let (tx, mut rx) = mpsc::unbounded_channel::<DownloadReport>();
        let mut tasks = JoinSet::new();

        info!(files = assets.len(), workers = self.workers, "Starting audio downloads");

        for asset in assets {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                bar.inc(1);
                let _ = tx.send(DownloadReport {
                    asset,
                    outcome: DownloadOutcome::Cancelled,
                });
                continue;
            };

            let http = self.http.clone();
            let tx = tx.clone();
            let bar = bar.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = download_one(&http, &asset).await;
                debug!(url = %asset.url, outcome = outcome.as_str(), "Download finished");
                bar.inc(1);
                let _ = tx.send(DownloadReport { asset, outcome });
            });
        }
        drop(tx);

        let mut summary = DownloadSummary::default();
        while let Some(report) = rx.recv().await {
            summary.record(&report);
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Download worker did not complete");
                summary.record_failure(format!("download worker failed: {e}"));
            }
        }
        bar.finish_and_clear();

        info!(
            downloaded = summary.downloaded,
            already_exists = summary.already_exists,
            failed = summary.failed,
            cancelled = summary.cancelled,
            bytes = summary.bytes,
            "Audio downloads complete"
        );
        summary
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} files ({eta})")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar
    }
}

/// Fetch a single asset unless an intact copy is already on disk
pub async fn download_one(http: &HttpClient, asset: &AudioAsset) -> DownloadOutcome {
    if let Ok(meta) = tokio::fs::metadata(&asset.target).await {
        let intact = match asset.expected_size {
            Some(size) => meta.len() == size,
            None => meta.len() > 0,
        };
        if meta.is_file() && intact {
            return DownloadOutcome::AlreadyExists;
        }
    }

    match transfer(http, asset).await {
        Ok(bytes) => DownloadOutcome::Downloaded { bytes },
        Err(e) => {
            warn!(url = %asset.url, target = %asset.target.display(), error = %e, "Download failed");
            DownloadOutcome::Failed {
                reason: format!("{e:#}"),
            }
        },
    }
}

async fn transfer(http: &HttpClient, asset: &AudioAsset) -> anyhow::Result<u64> {
    if let Some(parent) = asset.target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let response = http.get_stream(&asset.url).await?;
    let part = PartFile::new(asset.part_path());
    let mut file = tokio::fs::File::create(part.path())
        .await
        .with_context(|| format!("creating {}", part.path().display()))?;

    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("reading response body")?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(expected) = asset.expected_size {
        if written != expected {
            bail!("size mismatch: expected {expected} bytes, got {written}");
        }
    }

    tokio::fs::rename(part.path(), &asset.target).await?;
    part.disarm();
    Ok(written)
}

/// Removes the partial file unless the transfer completed
struct PartFile {
    path: PathBuf,
    armed: bool,
}

impl PartFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::clock::SystemClock;
    use crate::framework::transport::HttpConfig;
    use tempfile::TempDir;

    fn http() -> Arc<HttpClient> {
        Arc::new(HttpClient::new(&HttpConfig::default(), Arc::new(SystemClock)).unwrap())
    }

    #[test]
    fn test_part_path_appends_suffix() {
        let asset = AudioAsset::new("https://x/a.mp3", "/data/XC1.mp3", None);
        assert_eq!(asset.part_path(), PathBuf::from("/data/XC1.mp3.part"));
    }

    #[test]
    fn test_summary_samples_failures() {
        let mut summary = DownloadSummary::default();
        let asset = AudioAsset::new("https://x/a.mp3", "a.mp3", None);
        for _ in 0..25 {
            summary.record(&DownloadReport {
                asset: asset.clone(),
                outcome: DownloadOutcome::Failed { reason: "HTTP 404".into() },
            });
        }
        summary.record(&DownloadReport {
            asset,
            outcome: DownloadOutcome::Downloaded { bytes: 10 },
        });

        assert_eq!(summary.failed, 25);
        assert_eq!(summary.failures.len(), MAX_SAMPLED_FAILURES);
        assert_eq!(summary.bytes, 10);
        assert_eq!(summary.total(), 26);
    }

    #[tokio::test]
    async fn test_existing_file_with_matching_size_is_skipped() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("XC1.mp3");
        std::fs::write(&target, vec![0u8; 16]).unwrap();

        // unroutable url: reaching the network would fail the test
        let asset = AudioAsset::new("http://127.0.0.1:9/XC1.mp3", &target, Some(16));
        assert_eq!(download_one(&http(), &asset).await, DownloadOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let assets = (0..3)
            .map(|i| AudioAsset::new(format!("http://127.0.0.1:9/{i}.mp3"), dir.path().join(format!("{i}.mp3")), None))
            .collect();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = BulkDownloader::new(http(), 2).run(assets, cancel).await;
        assert_eq!(summary.cancelled, 3);
        assert_eq!(summary.downloaded, 0);
    }
}
