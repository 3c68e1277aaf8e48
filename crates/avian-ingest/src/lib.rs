//! Avian Biosurveillance Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Incremental ingestion of bird-acoustic detections and related
//! environmental data into a date-partitioned bronze file store.
//!
//! # Supported Data Sources
//!
//! - **BirdWeather**: citizen-science acoustic detections (GraphQL)
//! - **Xeno-canto**: reference recordings and audio for classifier training (REST)
//! - **KNMI**: hourly weather station observations (flat files)
//! - **Mortality surveillance**: DWHC pathology and Sovon dead-bird reports (flat files)
//!
//! Every source runs through the same sequence, driven by
//! [`framework::run::IngestionRun`]: connect, fetch (paginated and
//! rate-limited), validate, transform, load, checkpoint.
//!
//! # Example
//!
//! ```no_run
//! use avian_ingest::config::Settings;
//! use avian_ingest::orchestrator::IngestOrchestrator;
//! use avian_ingest::framework::run::RunOptions;
//! use avian_ingest::sources::SourceKind;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load(None)?;
//!     let orchestrator = IngestOrchestrator::new(settings)?;
//!     let runs = orchestrator
//!         .run_sources(&[SourceKind::BirdWeather], RunOptions::default())
//!         .await;
//!     println!("{}", runs[0].status);
//!     Ok(())
//! }
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod framework;
pub mod orchestrator;
pub mod reference;
pub mod sources;

pub use error::{IngestError, Result, TransformError, TransportError};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Avian biosurveillance data ingestion
#[derive(Parser, Debug)]
#[command(name = "avian-ingest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (YAML or JSON)
    #[arg(long, env = "BIOSURVEILLANCE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Root directory for bronze batches, checkpoints and audio
    #[arg(long, global = true)]
    pub data_path: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch new records from one or all sources
    Ingest(commands::ingest::IngestArgs),

    /// Show stored batches and checkpoints
    Status,

    /// Write a commented settings template
    InitConfig {
        /// Where to write the template
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
