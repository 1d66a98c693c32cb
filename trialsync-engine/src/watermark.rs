//! Watermark store: per-trial last-synchronized dates.
//!
//! Persists a `WatermarkFile` JSON document at `<state_dir>/watermark.json`.
//! Read once at the start of a run, advanced in memory, written back in full
//! at the end of the run with the atomic `.tmp` + rename pattern.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use trialsync_core::TrialKey;

use crate::error::{io_err, SyncError};

/// Trial key string → last date that trial was synchronized.
pub type Watermark = BTreeMap<String, NaiveDate>;

/// On-disk watermark payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatermarkFile {
    pub synced_at: DateTime<Utc>,
    pub trials: Watermark,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WatermarkCompat {
    Structured(WatermarkStructuredCompat),
    Legacy(Watermark),
}

#[derive(Debug, Deserialize)]
struct WatermarkStructuredCompat {
    pub synced_at: Option<DateTime<Utc>>,
    pub trials: Watermark,
}

impl WatermarkFile {
    pub fn empty() -> Self {
        Self {
            synced_at: Utc::now(),
            trials: Watermark::new(),
        }
    }

    /// Last synchronized date for `key`. Unknown keys sort before every
    /// real date so they are always processed.
    pub fn last_synced(&self, key: &TrialKey) -> NaiveDate {
        self.trials
            .get(key.as_str())
            .copied()
            .unwrap_or(NaiveDate::MIN)
    }

    /// `true` when a feed entry dated `updated` is newer than the watermark.
    pub fn needs_sync(&self, key: &TrialKey, updated: NaiveDate) -> bool {
        updated > self.last_synced(key)
    }

    /// Record that `key` is synchronized through `date`. Never moves a
    /// watermark backwards.
    pub fn advance(&mut self, key: &TrialKey, date: NaiveDate) {
        let entry = self
            .trials
            .entry(key.as_str().to_owned())
            .or_insert(date);
        if date > *entry {
            *entry = date;
        }
    }
}

/// `<state_dir>/watermark.json`
pub fn store_path_at(state_dir: &Path) -> PathBuf {
    state_dir.join("watermark.json")
}

/// Load the watermark. Returns an empty store if the file does not exist.
pub fn load_at(state_dir: &Path) -> Result<WatermarkFile, SyncError> {
    let path = store_path_at(state_dir);
    if !path.exists() {
        return Ok(WatermarkFile::empty());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let compat = serde_json::from_str::<WatermarkCompat>(&contents)
        .map_err(|source| SyncError::JsonFile { path, source })?;
    match compat {
        WatermarkCompat::Structured(store) => Ok(WatermarkFile {
            synced_at: store.synced_at.unwrap_or_else(Utc::now),
            trials: store.trials,
        }),
        WatermarkCompat::Legacy(trials) => Ok(WatermarkFile {
            synced_at: Utc::now(),
            trials,
        }),
    }
}

/// Save the watermark atomically: `<path>.tmp` then rename.
pub fn save_at(state_dir: &Path, store: &WatermarkFile) -> Result<(), SyncError> {
    std::fs::create_dir_all(state_dir).map_err(|e| io_err(state_dir, e))?;

    let path = store_path_at(state_dir);
    let json = serde_json::to_string_pretty(store)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}
