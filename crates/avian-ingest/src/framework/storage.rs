//! Bronze-layer batch files
//!
//! Layout: `{bronze}/{source_id}/{YYYY-MM-DD}/{batch_id}.json`, with side
//! datasets as `{batch_id}.{name}.jsonl` in the same partition. Files are
//! written to a hidden temp sibling and renamed into place, so readers never
//! observe a half-written batch.

use crate::error::Result;
use crate::framework::types::{Dataset, StandardizedRecord};
use avian_common::checksum::sha256_hex;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// One run's accepted records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFile {
    pub batch_id: String,
    pub source_id: String,
    pub ingestion_timestamp: DateTime<Utc>,
    pub record_count: usize,
    pub records: Vec<StandardizedRecord>,
}

impl BatchFile {
    pub fn new(
        source_id: impl Into<String>,
        batch_id: impl Into<String>,
        ingestion_timestamp: DateTime<Utc>,
        records: Vec<StandardizedRecord>,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            source_id: source_id.into(),
            ingestion_timestamp,
            record_count: records.len(),
            records,
        }
    }
}

/// Where a batch landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReceipt {
    pub path: PathBuf,
    pub record_count: usize,
    pub bytes: u64,
    pub sha256: String,
}

/// Per-source summary of what is on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInventory {
    pub source_id: String,
    pub batch_files: usize,
    pub partitions: usize,
    pub latest_partition: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BatchStore {
    bronze_dir: PathBuf,
}

impl BatchStore {
    pub fn new(bronze_dir: impl Into<PathBuf>) -> Self {
        Self {
            bronze_dir: bronze_dir.into(),
        }
    }

    pub fn bronze_dir(&self) -> &Path {
        &self.bronze_dir
    }

    pub fn partition_path(&self, source_id: &str, partition: NaiveDate, batch_id: &str) -> PathBuf {
        self.bronze_dir
            .join(source_id)
            .join(partition.format("%Y-%m-%d").to_string())
            .join(format!("{batch_id}.json"))
    }

    pub async fn write(&self, partition: NaiveDate, batch: &BatchFile) -> Result<BatchReceipt> {
        let path = self.partition_path(&batch.source_id, partition, &batch.batch_id);
        let bytes = serde_json::to_vec_pretty(batch)?;
        write_atomic(&path, &bytes).await?;

        let receipt = BatchReceipt {
            path,
            record_count: batch.record_count,
            bytes: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        };
        info!(
            path = %receipt.path.display(),
            records = receipt.record_count,
            bytes = receipt.bytes,
            sha256 = %receipt.sha256,
            "Batch written"
        );
        Ok(receipt)
    }

    pub fn dataset_path(&self, source_id: &str, partition: NaiveDate, batch_id: &str, name: &str) -> PathBuf {
        self.partition_path(source_id, partition, batch_id)
            .with_file_name(format!("{batch_id}.{name}.jsonl"))
    }

    /// Write `dataset` as JSON lines next to the batch of `batch_id`
    pub async fn write_dataset(
        &self,
        source_id: &str,
        partition: NaiveDate,
        batch_id: &str,
        dataset: &Dataset,
    ) -> Result<BatchReceipt> {
        let path = self.dataset_path(source_id, partition, batch_id, &dataset.name);
        let mut bytes = Vec::new();
        for row in &dataset.rows {
            serde_json::to_writer(&mut bytes, row)?;
            bytes.push(b'\n');
        }
        write_atomic(&path, &bytes).await?;

        let receipt = BatchReceipt {
            path,
            record_count: dataset.rows.len(),
            bytes: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        };
        info!(
            path = %receipt.path.display(),
            dataset = %dataset.name,
            rows = receipt.record_count,
            "Dataset written"
        );
        Ok(receipt)
    }

    pub async fn read(path: &Path) -> Result<BatchFile> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Count batch files per source directory
    pub async fn inventory(&self) -> Result<Vec<SourceInventory>> {
        let mut sources = Vec::new();
        for (source_id, source_dir) in list_dirs(&self.bronze_dir).await? {
            let mut batch_files = 0;
            let mut partitions = Vec::new();
            for (partition, partition_dir) in list_dirs(&source_dir).await? {
                let files = count_batches(&partition_dir).await?;
                if files > 0 {
                    batch_files += files;
                    partitions.push(partition);
                }
            }
            partitions.sort();
            sources.push(SourceInventory {
                source_id,
                batch_files,
                partitions: partitions.len(),
                latest_partition: partitions.pop(),
            });
        }
        sources.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(sources)
    }
}

async fn list_dirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    Ok(dirs)
}

async fn count_batches(dir: &Path) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".json") && !name.starts_with('.') {
            count += 1;
        }
    }
    Ok(count)
}

/// Write `bytes` to `path` via a temp sibling and rename
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_sibling(path);

    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if written.is_err() {
        // best effort; the original error is what matters
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    debug!(path = %path.display(), ok = written.is_ok(), "Atomic write");
    written
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}
