//! `trialsync init [--force]`

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;

use trialsync_core::{config, SyncConfig};

/// Write a template config file.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config file.
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self, explicit: Option<&Path>) -> Result<()> {
        let home = config::home().context("could not determine home directory")?;
        let path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config::config_path_at(&home));

        if path.exists() && !self.force {
            bail!(
                "config already exists at {}; pass --force to overwrite",
                path.display()
            );
        }

        config::save_at(&path, &SyncConfig::template())
            .with_context(|| format!("failed to write {}", path.display()))?;

        println!("✓ Wrote config template to {}", path.display());
        println!("  Set `server` and `token` (or TRIALSYNC_SERVER / TRIALSYNC_TOKEN) before syncing.");
        Ok(())
    }
}
