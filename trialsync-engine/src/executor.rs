//! Sync executor. Applies a [`SyncPlan`] to the registry.
//!
//! Every trial is isolated: a failure is logged, recorded in the
//! [`RunReport`], and the next trial proceeds. Only successful operations
//! advance the in-memory watermark.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde_json::Value;

use trialsync_core::TrialKey;

use crate::allocator::{self, Allocation, ProtocolEnvState};
use crate::client::{strip_server_fields, Document, TrialRegistry};
use crate::error::{io_err, SyncError};
use crate::planner::{CloseEntry, InsertEntry, SyncPlan, UpdateEntry};
use crate::relocate::{relocate, RelocatePolicy};
use crate::watermark::WatermarkFile;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Insert,
    Update,
    Close,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Insert => write!(f, "insert"),
            Action::Update => write!(f, "update"),
            Action::Close => write!(f, "close"),
        }
    }
}

/// What happened to one planned trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialOutcome {
    pub key: TrialKey,
    pub action: Action,
    pub protocol_no: Option<String>,
    /// `Err` carries the logged failure message.
    pub result: Result<(), String>,
    /// Set when the remote operation succeeded but the document could not
    /// be moved to the archive.
    pub archive_error: Option<String>,
}

impl TrialOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// All outcomes of one executed plan, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub outcomes: Vec<TrialOutcome>,
}

impl RunReport {
    /// `true` when at least one remote operation succeeded.
    pub fn any_success(&self) -> bool {
        self.outcomes.iter().any(TrialOutcome::succeeded)
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Applies plans against one registry.
pub struct Executor<'a> {
    registry: &'a dyn TrialRegistry,
    state_dir: PathBuf,
    archive_dir: PathBuf,
    relocate_policy: RelocatePolicy,
    today: NaiveDate,
    /// Loaded on the first insert, then threaded through the run.
    allocator: Option<ProtocolEnvState>,
}

impl<'a> Executor<'a> {
    pub fn new(
        registry: &'a dyn TrialRegistry,
        state_dir: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        relocate_policy: RelocatePolicy,
        today: NaiveDate,
    ) -> Self {
        Self {
            registry,
            state_dir: state_dir.into(),
            archive_dir: archive_dir.into(),
            relocate_policy,
            today,
            allocator: None,
        }
    }

    /// Apply `plan`: inserts, then updates, then closes.
    pub fn execute(&mut self, plan: SyncPlan, watermark: &mut WatermarkFile) -> RunReport {
        let mut report = RunReport::default();

        for (key, date) in &plan.settled {
            watermark.advance(key, *date);
        }
        for entry in plan.to_insert {
            report.outcomes.push(self.insert(entry, watermark));
        }
        for entry in plan.to_update {
            report.outcomes.push(self.update(entry, watermark));
        }
        for entry in plan.to_close {
            report.outcomes.push(self.close(entry, watermark));
        }

        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "sync plan executed"
        );
        report
    }

    fn insert(&mut self, entry: InsertEntry, watermark: &mut WatermarkFile) -> TrialOutcome {
        let mut outcome = TrialOutcome {
            key: entry.key.clone(),
            action: Action::Insert,
            protocol_no: None,
            result: Ok(()),
            archive_error: None,
        };

        let attempt = self.try_insert(&entry);
        match attempt {
            Ok(allocation) => {
                tracing::info!(
                    key = %entry.key,
                    protocol_id = allocation.protocol_id,
                    protocol_no = %allocation.protocol_no,
                    "inserted trial"
                );
                outcome.protocol_no = Some(allocation.protocol_no);
                watermark.advance(&entry.key, entry.updated);
                outcome.archive_error = self.archive(&entry.file);
            }
            Err(err) => {
                tracing::error!(key = %entry.key, error = %err, "insert failed");
                outcome.result = Err(err.to_string());
            }
        }
        outcome
    }

    fn try_insert(&mut self, entry: &InsertEntry) -> Result<Allocation, SyncError> {
        let mut document = load_document(&entry.file)?;
        strip_server_fields(&mut document);
        let today = self.today;
        let allocation = self.allocator_state()?.advance(today);
        stamp(&mut document, Some(allocation.protocol_id), Some(&allocation.protocol_no));

        self.registry.create(&document)?;

        if let Some(state) = &self.allocator {
            // Remote insert already applied; a save failure is only logged.
            if let Err(err) = allocator::save_at(&self.state_dir, state) {
                tracing::error!(error = %err, "could not persist protocol environment");
            }
        }
        Ok(allocation)
    }

    fn allocator_state(&mut self) -> Result<&mut ProtocolEnvState, SyncError> {
        let state = match self.allocator.take() {
            Some(state) => state,
            None => allocator::load_at(&self.state_dir)?,
        };
        Ok(self.allocator.insert(state))
    }

    fn update(&mut self, entry: UpdateEntry, watermark: &mut WatermarkFile) -> TrialOutcome {
        let mut outcome = TrialOutcome {
            key: entry.key.clone(),
            action: Action::Update,
            protocol_no: entry.protocol_no.clone(),
            result: Ok(()),
            archive_error: None,
        };

        let attempt = load_document(&entry.file).and_then(|mut document| {
            strip_server_fields(&mut document);
            stamp(&mut document, entry.protocol_id, entry.protocol_no.as_deref());
            self.registry
                .replace(&entry.registry_id, &entry.concurrency_token, &document)
                .map_err(SyncError::from)
        });

        match attempt {
            Ok(()) => {
                tracing::info!(key = %entry.key, registry_id = %entry.registry_id, "updated trial");
                watermark.advance(&entry.key, entry.updated);
                outcome.archive_error = self.archive(&entry.file);
            }
            Err(err) => {
                tracing::error!(key = %entry.key, error = %err, "update failed");
                outcome.result = Err(err.to_string());
            }
        }
        outcome
    }

    fn close(&mut self, entry: CloseEntry, watermark: &mut WatermarkFile) -> TrialOutcome {
        let payload = entry.remote.closed_payload();
        let result = self.registry.replace(
            &entry.remote.registry_id,
            &entry.remote.concurrency_token,
            &payload,
        );

        let result = match result {
            Ok(()) => {
                tracing::info!(key = %entry.key, registry_id = %entry.remote.registry_id, "closed trial");
                watermark.advance(&entry.key, entry.updated);
                Ok(())
            }
            Err(err) => {
                tracing::error!(key = %entry.key, error = %err, "close failed");
                Err(err.to_string())
            }
        };

        TrialOutcome {
            key: entry.key,
            action: Action::Close,
            protocol_no: entry.remote.protocol_no,
            result,
            archive_error: None,
        }
    }

    /// Move a processed document to the archive; failures stay per-file.
    fn archive(&self, file: &Path) -> Option<String> {
        match relocate(file, &self.archive_dir, self.relocate_policy) {
            Ok(_) => None,
            Err(err) => {
                tracing::error!(path = %file.display(), error = %err, "could not archive trial document");
                Some(err.to_string())
            }
        }
    }
}

/// Read a trial document; it must be a JSON object.
pub fn load_document(path: &Path) -> Result<Document, SyncError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let value: Value = serde_json::from_str(&contents).map_err(|source| SyncError::JsonFile {
        path: path.to_path_buf(),
        source,
    })?;
    match value {
        Value::Object(document) => Ok(document),
        _ => Err(SyncError::NotAnObject {
            path: path.to_path_buf(),
        }),
    }
}

fn stamp(document: &mut Document, protocol_id: Option<u64>, protocol_no: Option<&str>) {
    if let Some(id) = protocol_id {
        document.insert("protocol_id".into(), Value::from(id));
    }
    if let Some(no) = protocol_no {
        document.insert("protocol_no".into(), Value::from(no));
    }
}
