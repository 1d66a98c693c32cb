//! Domain types for trial synchronization.
//!
//! Identifiers coming from the feed or the remote registry are wrapped in
//! newtypes so an NCT id can never be passed where a registry `_id` is
//! expected.

use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A ClinicalTrials.gov identifier such as `NCT01234567`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NctId(pub String);

impl NctId {
    /// Parse a raw feed value. Returns `None` for blanks and for the
    /// feed's "not applicable" sentinel (any case).
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if is_not_applicable(trimmed) {
            None
        } else {
            Some(Self(trimmed.to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NctId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for NctId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Server-assigned document identifier (`_id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistryId(pub String);

impl fmt::Display for RegistryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for RegistryId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque optimistic-concurrency token (`_etag`). Changes on every
/// server-side mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcurrencyToken(pub String);

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ConcurrencyToken {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Trial key
// ---------------------------------------------------------------------------

/// Identity used for watermark lookups and for naming a trial's document.
///
/// A real NCT id always wins; otherwise the first local protocol id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrialKey {
    Nct(NctId),
    Local(String),
}

impl TrialKey {
    pub fn as_str(&self) -> &str {
        match self {
            TrialKey::Nct(id) => id.as_str(),
            TrialKey::Local(id) => id,
        }
    }

    /// File name of the trial document, `<key>.json`.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.as_str())
    }

    /// `true` when [`file_name`](Self::file_name) is a single plain path
    /// component, so joining it onto a directory stays inside that directory.
    pub fn is_file_safe(&self) -> bool {
        let key = self.as_str();
        if key.is_empty() || key == "." || key == ".." {
            return false;
        }
        if key.contains(|c: char| matches!(c, '/' | '\\' | '\0')) {
            return false;
        }
        let name = self.file_name();
        let mut components = Path::new(&name).components();
        matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        )
    }
}

impl fmt::Display for TrialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Trial status as reported by the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    #[default]
    Active,
    Closed,
    Other,
}

impl TrialStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, TrialStatus::Closed)
    }
}

impl FromStr for TrialStatus {
    type Err = std::convert::Infallible;

    /// Unknown values map to [`TrialStatus::Other`]; matching is
    /// case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "active" => TrialStatus::Active,
            "closed" => TrialStatus::Closed,
            _ => TrialStatus::Other,
        })
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialStatus::Active => write!(f, "active"),
            TrialStatus::Closed => write!(f, "closed"),
            TrialStatus::Other => write!(f, "other"),
        }
    }
}

/// Status string written to the registry when a trial is closed.
pub const CLOSED_STATUS: &str = "closed";

/// `true` when a registry status string denotes a closed trial.
pub fn is_closed_status(status: &str) -> bool {
    status.trim().eq_ignore_ascii_case(CLOSED_STATUS)
}

// ---------------------------------------------------------------------------
// Feed record
// ---------------------------------------------------------------------------

/// One row of the authoritative status feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialStatusRecord {
    pub nct_id: Option<NctId>,
    pub local_protocol_ids: Vec<String>,
    pub status: TrialStatus,
    pub last_updated: NaiveDate,
}

impl TrialStatusRecord {
    /// Derive the trial key. `None` when the row carries neither a real
    /// NCT id nor any local protocol id.
    pub fn trial_key(&self) -> Option<TrialKey> {
        if let Some(nct) = &self.nct_id {
            return Some(TrialKey::Nct(nct.clone()));
        }
        self.local_protocol_ids
            .first()
            .map(|id| TrialKey::Local(id.clone()))
    }
}

/// Split a pipe-delimited list, trimming entries and dropping blanks.
pub fn split_pipe_list(raw: &str) -> Vec<String> {
    raw.split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// The feed writes this in place of a missing NCT id.
const NOT_APPLICABLE: &str = "not applicable";

fn is_not_applicable(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case(NOT_APPLICABLE)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn record(nct: &str, locals: &str) -> TrialStatusRecord {
        TrialStatusRecord {
            nct_id: NctId::parse(nct),
            local_protocol_ids: split_pipe_list(locals),
            status: TrialStatus::Active,
            last_updated: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        }
    }

    #[test]
    fn nct_id_wins_over_local_ids() {
        let key = record("NCT001", "LOC-1|LOC-2").trial_key().unwrap();
        assert_eq!(key, TrialKey::Nct(NctId::from("NCT001")));
    }

    #[test]
    fn sentinel_nct_falls_back_to_first_local_id() {
        for sentinel in ["Not Applicable", "NOT APPLICABLE", "", "  "] {
            let key = record(sentinel, " LOC-9 | LOC-2").trial_key().unwrap();
            assert_eq!(key, TrialKey::Local("LOC-9".into()), "sentinel {sentinel:?}");
        }
    }

    #[test]
    fn unkeyable_row_has_no_key() {
        assert!(record("not applicable", " | ").trial_key().is_none());
    }

    #[test]
    fn key_names_the_document_file() {
        assert_eq!(TrialKey::Local("17-123".into()).file_name(), "17-123.json");
    }

    #[test]
    fn only_the_exact_sentinel_means_no_nct_id() {
        assert_eq!(NctId::parse("N/A"), Some(NctId::from("N/A")));
        assert_eq!(NctId::parse(" not applicable "), None);
    }

    #[test]
    fn keys_that_escape_the_trial_dir_are_not_file_safe() {
        for key in ["../secret", "..", ".", "a/b", "a\\b", "/etc/passwd", ""] {
            assert!(!TrialKey::Local(key.into()).is_file_safe(), "{key:?}");
        }
        for key in ["17-123", "NCT04567890", "..17", "LOC.v2"] {
            assert!(TrialKey::Local(key.into()).is_file_safe(), "{key:?}");
        }
        assert!(!TrialKey::Nct(NctId::from("NCT/../x")).is_file_safe());
    }

    #[test]
    fn status_parsing_is_case_insensitive() {
        assert_eq!("CLOSED".parse::<TrialStatus>().unwrap(), TrialStatus::Closed);
        assert_eq!("Active".parse::<TrialStatus>().unwrap(), TrialStatus::Active);
        assert_eq!("suspended".parse::<TrialStatus>().unwrap(), TrialStatus::Other);
        assert!(is_closed_status(" Closed "));
        assert!(!is_closed_status("open"));
    }
}
