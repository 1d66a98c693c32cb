pub mod init;
pub mod sync;
pub mod trial;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use trialsync_core::{config, SyncConfig};

/// Home directory plus the loaded config, with logging installed.
pub struct Session {
    pub home: PathBuf,
    pub config: SyncConfig,
}

impl Session {
    pub fn open(explicit: Option<&Path>) -> Result<Self> {
        let home = config::home().context("could not determine home directory")?;
        let config = config::load_at(&home, explicit).context("failed to load configuration")?;
        crate::logging::init(config.log_file.as_deref())?;
        Ok(Self { home, config })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.config.state_dir_at(&self.home)
    }
}
