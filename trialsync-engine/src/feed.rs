//! Authoritative status feed reader.
//!
//! The feed is either a CSV file with a header row or a `.json` file holding
//! an array of row objects. Both carry the same columns:
//!
//! | column                    | meaning                                      |
//! |---------------------------|----------------------------------------------|
//! | `nct_id`                  | NCT id, or a "not applicable" sentinel       |
//! | `local_protocol_ids`      | pipe-delimited local ids (JSON: list allowed)|
//! | `status`                  | `active`, `closed`, anything else is `other` |
//! | `entry_last_updated_date` | ISO date; a trailing time part is ignored    |
//!
//! Extra columns are ignored. Rows that cannot be parsed are logged and
//! skipped; a file that cannot be read at all is an error.

use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;

use trialsync_core::types::{split_pipe_list, NctId, TrialStatus, TrialStatusRecord};

use crate::error::{io_err, SyncError};

const REQUIRED_COLUMNS: [&str; 4] = [
    "nct_id",
    "local_protocol_ids",
    "status",
    "entry_last_updated_date",
];

#[derive(Debug, Deserialize)]
struct CsvRow {
    nct_id: Option<String>,
    local_protocol_ids: Option<String>,
    status: Option<String>,
    entry_last_updated_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonRow {
    #[serde(default)]
    nct_id: Option<String>,
    #[serde(default)]
    local_protocol_ids: Option<ProtocolIds>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    entry_last_updated_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProtocolIds {
    Joined(String),
    List(Vec<String>),
}

impl ProtocolIds {
    fn into_vec(self) -> Vec<String> {
        match self {
            ProtocolIds::Joined(raw) => split_pipe_list(&raw),
            ProtocolIds::List(ids) => ids
                .into_iter()
                .map(|id| id.trim().to_owned())
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }
}

/// Read every parsable row of the feed, in file order.
pub fn read_feed(path: &Path) -> Result<Vec<TrialStatusRecord>, SyncError> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let records = if is_json {
        read_json(path)?
    } else {
        read_csv(path)?
    };
    tracing::debug!(path = %path.display(), rows = records.len(), "status feed loaded");
    Ok(records)
}

fn read_csv(path: &Path) -> Result<Vec<TrialStatusRecord>, SyncError> {
    let feed_err = |source| SyncError::Feed {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(feed_err)?;

    let headers = reader.headers().map_err(feed_err)?.clone();
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|col| !headers.iter().any(|h| h == *col))
        .collect();
    if !missing.is_empty() {
        return Err(SyncError::FeedColumns {
            path: path.to_path_buf(),
            columns: missing.join(", "),
        });
    }

    let mut records = Vec::new();
    for (index, row) in reader.deserialize::<CsvRow>().enumerate() {
        // Header is line 1.
        let line = index + 2;
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                tracing::warn!(line, error = %err, "skipping unreadable feed row");
                continue;
            }
        };
        let local_ids = row
            .local_protocol_ids
            .as_deref()
            .map(split_pipe_list)
            .unwrap_or_default();
        push_record(
            &mut records,
            line,
            row.nct_id.as_deref(),
            local_ids,
            row.status.as_deref(),
            row.entry_last_updated_date.as_deref(),
        );
    }
    Ok(records)
}

fn read_json(path: &Path) -> Result<Vec<TrialStatusRecord>, SyncError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let rows: Vec<serde_json::Value> =
        serde_json::from_str(&contents).map_err(|source| SyncError::JsonFile {
            path: path.to_path_buf(),
            source,
        })?;

    let mut records = Vec::new();
    for (index, value) in rows.into_iter().enumerate() {
        let line = index + 1;
        let row: JsonRow = match serde_json::from_value(value) {
            Ok(row) => row,
            Err(err) => {
                tracing::warn!(row = line, error = %err, "skipping unreadable feed row");
                continue;
            }
        };
        let local_ids = row
            .local_protocol_ids
            .map(ProtocolIds::into_vec)
            .unwrap_or_default();
        push_record(
            &mut records,
            line,
            row.nct_id.as_deref(),
            local_ids,
            row.status.as_deref(),
            row.entry_last_updated_date.as_deref(),
        );
    }
    Ok(records)
}

fn push_record(
    records: &mut Vec<TrialStatusRecord>,
    line: usize,
    nct_id: Option<&str>,
    local_protocol_ids: Vec<String>,
    status: Option<&str>,
    updated: Option<&str>,
) {
    let Some(last_updated) = updated.and_then(parse_feed_date) else {
        tracing::warn!(
            line,
            value = updated.unwrap_or(""),
            "skipping feed row with unparsable entry_last_updated_date"
        );
        return;
    };
    let status = status
        .map(|s| s.parse().unwrap_or(TrialStatus::Other))
        .unwrap_or(TrialStatus::Other);
    records.push(TrialStatusRecord {
        nct_id: nct_id.and_then(NctId::parse),
        local_protocol_ids,
        status,
        last_updated,
    });
}

/// Parse `YYYY-MM-DD`, ignoring any `T…`/` …` time suffix.
pub fn parse_feed_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let date_part = trimmed
        .split(|c: char| c == 'T' || c == ' ')
        .next()
        .unwrap_or(trimmed);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}
