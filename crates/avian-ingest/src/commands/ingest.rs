//! `avian-ingest ingest` command implementation
//!
//! Runs the selected sources and prints a per-source summary. Per-source
//! failures are reported, not returned: the command only errors when it
//! cannot start.

use crate::commands::format_bytes;
use crate::config::Settings;
use crate::framework::run::RunOptions;
use crate::framework::types::{IngestionStatus, RunMetadata};
use crate::orchestrator::{IngestOrchestrator, IngestSummary};
use crate::sources::SourceKind;
use anyhow::Result;
use chrono::{Duration, Utc};
use clap::{ArgGroup, Args};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors shown per source before the rest is summarized
const ERRORS_SHOWN: usize = 5;

#[derive(Args, Debug, Clone)]
#[command(group(ArgGroup::new("target").required(true).args(["source", "all"])))]
pub struct IngestArgs {
    /// Source to ingest (birdweather, xeno_canto, knmi_weather, mortality_surveillance)
    #[arg(short, long)]
    pub source: Option<SourceKind>,

    /// Ingest every source
    #[arg(long)]
    pub all: bool,

    /// Fetch the last N days, ignoring the checkpoint
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub days: Option<u32>,

    /// Ignore checkpoints and leave them untouched
    #[arg(long)]
    pub full: bool,

    /// Download audio for accepted records
    #[arg(long)]
    pub download_audio: bool,
}

impl IngestArgs {
    pub fn kinds(&self) -> Vec<SourceKind> {
        match self.source {
            Some(kind) if !self.all => vec![kind],
            _ => SourceKind::all().to_vec(),
        }
    }

    pub fn options(&self, cancel: CancellationToken) -> RunOptions {
        let mut options = RunOptions {
            incremental: !self.full,
            download_audio: self.download_audio,
            cancel,
            ..RunOptions::default()
        };
        if let Some(days) = self.days {
            let now = Utc::now();
            options.start = Some(now - Duration::days(i64::from(days)));
            options.end = Some(now);
        }
        options
    }
}

pub async fn run(settings: Settings, args: IngestArgs, progress: bool) -> Result<()> {
    let orchestrator = IngestOrchestrator::new(settings)?.with_progress(progress);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight work");
            on_interrupt.cancel();
        }
    });

    let runs = orchestrator
        .run_sources(&args.kinds(), args.options(cancel))
        .await;

    for run in &runs {
        print_run(run);
    }
    print_totals(&IngestSummary::from_runs(&runs));
    Ok(())
}

fn print_run(run: &RunMetadata) {
    let status = match run.status {
        IngestionStatus::Success => run.status.as_str().green(),
        IngestionStatus::Partial => run.status.as_str().yellow(),
        IngestionStatus::Failed => run.status.as_str().red(),
        IngestionStatus::Skipped => run.status.as_str().dimmed(),
    };
    println!("{} {}", run.source_id.bold(), status);
    if run.status == IngestionStatus::Skipped {
        println!();
        return;
    }

    println!(
        "  Records:    {} fetched, {} validated, {} failed",
        run.records_fetched, run.records_validated, run.records_failed
    );
    if let Some(window) = &run.window {
        println!("  Window:     {} .. {}", window.start.to_rfc3339(), window.end.to_rfc3339());
    }
    if let Some(path) = &run.batch_path {
        println!("  Batch:      {}", path.display());
    }
    for path in &run.datasets {
        println!("  Dataset:    {}", path.display());
    }
    if let Some(checkpoint) = run.checkpoint {
        println!("  Checkpoint: {}", checkpoint.to_rfc3339());
    }
    if let Some(downloads) = &run.downloads {
        println!(
            "  Audio:      {} downloaded ({}), {} already present, {} failed, {} cancelled",
            downloads.downloaded,
            format_bytes(downloads.bytes),
            downloads.already_exists,
            downloads.failed,
            downloads.cancelled
        );
    }
    if let Some(duration) = run.duration() {
        println!("  Duration:   {:.1}s", duration.num_milliseconds() as f64 / 1000.0);
    }

    for message in run.error_messages.iter().take(ERRORS_SHOWN) {
        println!("  {} {}", "!".red(), message);
    }
    let hidden = (run.error_messages.len().saturating_sub(ERRORS_SHOWN)) as u64 + run.errors_dropped();
    if hidden > 0 {
        println!("  ... and {hidden} more");
    }
    println!();
}

fn print_totals(summary: &IngestSummary) {
    println!("{}", "Summary:".cyan().bold());
    println!(
        "  Sources: {} ({} succeeded, {} partial, {} failed, {} skipped)",
        summary.sources, summary.succeeded, summary.partial, summary.failed, summary.skipped
    );
    println!(
        "  Records: {} fetched, {} validated, {} failed",
        summary.records_fetched, summary.records_validated, summary.records_failed
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::Cli;
    use clap::Parser;

    fn ingest_args(argv: &[&str]) -> IngestArgs {
        match Cli::try_parse_from(argv).unwrap().command {
            crate::Commands::Ingest(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_single_source() {
        let args = ingest_args(&["avian-ingest", "ingest", "--source", "knmi"]);
        assert_eq!(args.kinds(), vec![SourceKind::Knmi]);

        let options = args.options(CancellationToken::new());
        assert!(options.incremental);
        assert!(options.start.is_none());
    }

    #[test]
    fn test_all_with_days_and_full() {
        let args = ingest_args(&["avian-ingest", "ingest", "--all", "--days", "3", "--full", "--download-audio"]);
        assert_eq!(args.kinds().len(), 4);

        let options = args.options(CancellationToken::new());
        assert!(!options.incremental);
        assert!(options.download_audio);
        let (start, end) = (options.start.unwrap(), options.end.unwrap());
        assert_eq!(end - start, Duration::days(3));
    }

    #[test]
    fn test_source_or_all_required() {
        assert!(Cli::try_parse_from(["avian-ingest", "ingest"]).is_err());
        assert!(Cli::try_parse_from(["avian-ingest", "ingest", "--all", "--source", "knmi"]).is_err());
        assert!(Cli::try_parse_from(["avian-ingest", "ingest", "--source", "ebird"]).is_err());
        assert!(Cli::try_parse_from(["avian-ingest", "ingest", "--all", "--days", "0"]).is_err());
    }
}
