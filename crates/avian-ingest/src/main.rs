//! avian-ingest - Main entry point

use avian_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use avian_ingest::config::Settings;
use avian_ingest::{commands, Cli, Commands};
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("avian-ingest")
        .build();

    // Environment variables take precedence over flags
    let log_config = match log_config.clone().apply_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: ignoring invalid logging environment: {e}");
            log_config
        },
    };

    // The CLI still works without logging
    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e}");
            None
        },
    };

    if let Err(e) = execute_command(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        // exit skips destructors; flush file logs first
        drop(guard);
        process::exit(1);
    }
}

async fn execute_command(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        command,
        config,
        data_path,
        ..
    } = cli;

    match command {
        Commands::Ingest(args) => {
            let settings = load_settings(config.as_deref(), data_path)?;
            commands::ingest::run(settings, args, std::io::stderr().is_terminal()).await
        },
        Commands::Status => {
            let settings = load_settings(config.as_deref(), data_path)?;
            commands::status::run(&settings).await
        },
        Commands::InitConfig { output, force } => commands::init_config::run(&output, force),
    }
}

fn load_settings(config: Option<&Path>, data_path: Option<PathBuf>) -> anyhow::Result<Settings> {
    let mut settings = Settings::load(config)?;
    if let Some(path) = data_path {
        settings.storage.base_path = path;
    }
    Ok(settings)
}
