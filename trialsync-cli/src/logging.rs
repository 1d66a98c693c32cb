//! Subscriber setup for the optional log file.
//!
//! A configured `log_file` that has grown past 1 MiB is shifted aside at
//! start-up: `sync.log` becomes `sync.log.1`, older copies move up by one,
//! and anything beyond `sync.log.5` is overwritten.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Size-based retention for the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub max_bytes: u64,
    pub keep: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            keep: 5,
        }
    }
}

impl Retention {
    /// Open `path` for appending, shifting it to `<path>.1` first when it
    /// has reached `max_bytes`. The flag reports whether a shift happened.
    pub fn open(&self, path: &Path) -> Result<(File, bool)> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log directory {}", dir.display()))?;
        }
        let shifted = self.is_full(path)? && self.keep > 0;
        if shifted {
            self.shift(path)
                .with_context(|| format!("cannot rotate {}", path.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        Ok((file, shifted))
    }

    fn is_full(&self, path: &Path) -> Result<bool> {
        match fs::metadata(path) {
            Ok(meta) => Ok(meta.len() >= self.max_bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("cannot stat {}", path.display())),
        }
    }

    /// Move every copy up one slot, oldest first. `rename` replaces the
    /// copy in the last slot.
    fn shift(&self, path: &Path) -> io::Result<()> {
        for slot in (1..=self.keep).rev() {
            let from = if slot == 1 { path.to_path_buf() } else { backup(path, slot - 1) };
            match fs::rename(&from, backup(path, slot)) {
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                other => other?,
            }
        }
        Ok(())
    }
}

/// `sync.log` + 2 -> `sync.log.2`.
fn backup(path: &Path, slot: usize) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".{slot}"));
    PathBuf::from(name)
}

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
///
/// Without `log_file` events go to stderr so command output on stdout stays
/// clean.
pub fn init(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(path) = log_file else {
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(io::stderr)
            .try_init();
        return Ok(());
    };

    let (file, shifted) = Retention::default().open(path)?;
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
    if shifted {
        tracing::info!(path = %path.display(), "log file rotated");
    }
    Ok(())
}
