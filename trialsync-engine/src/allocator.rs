//! Protocol number allocator.
//!
//! Mints `(protocol_id, protocol_no)` pairs for newly inserted trials.
//! `protocol_id` grows by one per allocation for all time; `protocol_no` is
//! `YYYYMMDD` followed by a two-digit per-day sequence that restarts at `00`
//! whenever the calendar date changes.
//!
//! State lives at `<state_dir>/protocol_env.json`. The engine loads it once
//! per run, threads it through every insert, and writes it back only after a
//! successful insert. Numbers handed to inserts that later fail are never
//! reclaimed.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{io_err, SyncError};

/// Largest sequence value that still fits the two-digit suffix.
pub const MAX_DAILY_SEQUENCE: u32 = 99;

/// Persisted allocator state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolEnvState {
    pub protocol_id_counter: u64,
    #[serde(with = "padded_counter")]
    pub protocol_no_counter: u32,
    #[serde(default, with = "compact_date")]
    pub current_date: Option<NaiveDate>,
    #[serde(default)]
    pub protocol_no: Option<String>,
}

/// Identifiers stamped onto one inserted trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub protocol_id: u64,
    pub protocol_no: String,
}

impl ProtocolEnvState {
    /// Initial state continuing after the registry's current maximum.
    ///
    /// `max_protocol_no` is parsed back into its date and sequence parts so
    /// that a same-day insert continues the sequence instead of reusing it.
    pub fn seeded(max_protocol_id: u64, max_protocol_no: Option<&str>) -> Self {
        let parsed = max_protocol_no.and_then(split_protocol_no);
        Self {
            protocol_id_counter: max_protocol_id,
            protocol_no_counter: parsed.map(|(_, seq)| seq).unwrap_or(0),
            current_date: parsed.map(|(date, _)| date),
            protocol_no: max_protocol_no.map(str::to_owned),
        }
    }

    /// Advance the counters for one insert happening on `today`.
    pub fn advance(&mut self, today: NaiveDate) -> Allocation {
        self.protocol_id_counter = self.protocol_id_counter.saturating_add(1);

        if self.current_date == Some(today) {
            self.protocol_no_counter = self.protocol_no_counter.saturating_add(1);
        } else {
            self.protocol_no_counter = 0;
            self.current_date = Some(today);
        }

        if self.protocol_no_counter > MAX_DAILY_SEQUENCE {
            tracing::warn!(
                sequence = self.protocol_no_counter,
                "daily protocol sequence exceeded two digits"
            );
        }

        let protocol_no = format!(
            "{}{:02}",
            today.format("%Y%m%d"),
            self.protocol_no_counter
        );
        self.protocol_no = Some(protocol_no.clone());

        Allocation {
            protocol_id: self.protocol_id_counter,
            protocol_no,
        }
    }
}

/// `<state_dir>/protocol_env.json`
pub fn state_path_at(state_dir: &Path) -> PathBuf {
    state_dir.join("protocol_env.json")
}

/// Load allocator state. A missing file is an error: minting identifiers
/// from zero would collide with trials already in the registry.
pub fn load_at(state_dir: &Path) -> Result<ProtocolEnvState, SyncError> {
    let path = state_path_at(state_dir);
    if !path.exists() {
        return Err(SyncError::Missing {
            what: "protocol environment (run `trialsync trial seed-env`)",
            path,
        });
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_json::from_str(&contents).map_err(|source| SyncError::JsonFile { path, source })
}

/// Overwrite the allocator state atomically.
pub fn save_at(state_dir: &Path, state: &ProtocolEnvState) -> Result<(), SyncError> {
    std::fs::create_dir_all(state_dir).map_err(|e| io_err(state_dir, e))?;

    let path = state_path_at(state_dir);
    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

fn split_protocol_no(raw: &str) -> Option<(NaiveDate, u32)> {
    if raw.len() < 10 || !raw.is_char_boundary(8) {
        return None;
    }
    let (date, seq) = raw.split_at(8);
    let date = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
    let seq = seq.parse().ok()?;
    Some((date, seq))
}

/// Sequence counter stored as a zero-padded string; integers are accepted
/// on load.
mod padded_counter {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u32),
    }

    pub fn serialize<S: Serializer>(value: &u32, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{value:02}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("invalid counter '{text}'"))),
        }
    }
}

/// `Option<NaiveDate>` as `"YYYYMMDD"` or `null`.
mod compact_date {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y%m%d";

    pub fn serialize<S: Serializer>(value: &Option<NaiveDate>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(date) => s.serialize_str(&date.format(FORMAT).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDate>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => NaiveDate::parse_from_str(text, FORMAT)
                .map(Some)
                .map_err(|e| serde::de::Error::custom(format!("invalid date '{text}': {e}"))),
        }
    }
}
