//! `avian-ingest init-config` command implementation

use crate::config::DEFAULT_CONFIG_YAML;
use anyhow::{bail, Context, Result};
use std::path::Path;

/// Write the settings template to `output`
pub fn run(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(output, DEFAULT_CONFIG_YAML)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Wrote settings template to {}", output.display());
    Ok(())
}
