//! `avian-ingest status` command implementation
//!
//! Shows which sources are enabled, how many batches each has written and
//! where its checkpoint stands.

use crate::config::Settings;
use crate::framework::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::framework::storage::{BatchStore, SourceInventory};
use crate::sources::SourceKind;
use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

/// Status line for one source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub source_id: String,
    pub enabled: bool,
    pub batch_files: usize,
    pub latest_partition: Option<String>,
    pub last_timestamp: Option<String>,
}

/// Collect the status of every known source
pub async fn collect(settings: &Settings) -> Result<Vec<SourceStatus>> {
    let batches = BatchStore::new(settings.storage.bronze_dir());
    let checkpoints = FileCheckpointStore::new(settings.storage.checkpoint_dir());
    let inventory = batches.inventory().await?;

    let mut statuses = Vec::new();
    for kind in SourceKind::all() {
        let stored: Option<&SourceInventory> = inventory.iter().find(|i| i.source_id == kind.as_str());
        let last_timestamp = match checkpoints.load(kind.as_str()).await {
            Ok(checkpoint) => checkpoint.map(|c| c.last_timestamp.to_rfc3339()),
            Err(e) => Some(format!("unreadable ({e})")),
        };
        statuses.push(SourceStatus {
            source_id: kind.as_str().to_string(),
            enabled: kind.enabled(settings),
            batch_files: stored.map_or(0, |i| i.batch_files),
            latest_partition: stored.and_then(|i| i.latest_partition.clone()),
            last_timestamp,
        });
    }
    Ok(statuses)
}

pub async fn run(settings: &Settings) -> Result<()> {
    let statuses = collect(settings).await?;

    println!("{}", "Data Path:".cyan().bold());
    println!("  {}", settings.storage.base_path.display());
    println!();

    println!("{}", "Sources:".cyan().bold());
    for status in &statuses {
        let state = if status.enabled {
            "enabled".green()
        } else {
            "disabled".dimmed()
        };
        println!("{} {}", status.source_id.bold(), state);
        println!("  Batches:    {}", status.batch_files);
        if let Some(partition) = &status.latest_partition {
            println!("  Latest:     {partition}");
        }
        println!(
            "  Checkpoint: {}",
            status.last_timestamp.as_deref().unwrap_or("none")
        );
        println!();
    }
    Ok(())
}
