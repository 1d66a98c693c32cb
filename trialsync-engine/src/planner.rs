//! Reconciliation planner.
//!
//! Decides, per feed row, whether the trial is new, changed, or must be
//! closed. Rows whose `entry_last_updated_date` is not newer than the
//! watermark are never looked up.
//!
//! ## Classification
//!
//! | key     | remote match | remote closed | feed closed | plan    |
//! |---------|--------------|---------------|-------------|---------|
//! | NCT     | none         | -             | -           | insert  |
//! | NCT     | yes          | yes           | -           | settled |
//! | NCT     | yes          | no            | yes         | close   |
//! | NCT     | yes          | no            | no          | update  |
//! | local   | none         | -             | -           | insert  |
//! | local   | yes          | yes           | -           | settled |
//! | local   | yes          | no            | yes         | skipped |
//! | local   | yes          | no            | no          | update  |
//!
//! Closing needs an NCT match; locally keyed rows are never closed.
//! "Settled" rows need no remote change and only advance the watermark.
//! Keys that are not a plain file name (`../x`, `a/b`) are dropped before
//! any lookup.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use trialsync_core::{ConcurrencyToken, RegistryId, TrialKey, TrialStatusRecord};

use crate::client::{find_first, RemoteTrial, TrialQuery, TrialRegistry};
use crate::watermark::WatermarkFile;

// ---------------------------------------------------------------------------
// Plan entries
// ---------------------------------------------------------------------------

/// A trial absent from the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertEntry {
    pub key: TrialKey,
    pub updated: NaiveDate,
    pub file: PathBuf,
}

/// A trial present in the registry whose feed entry changed.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEntry {
    pub key: TrialKey,
    pub updated: NaiveDate,
    pub file: PathBuf,
    pub registry_id: RegistryId,
    pub concurrency_token: ConcurrencyToken,
    pub protocol_id: Option<u64>,
    pub protocol_no: Option<String>,
}

/// An open registry trial the feed marks closed.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseEntry {
    pub key: TrialKey,
    pub updated: NaiveDate,
    pub remote: RemoteTrial,
}

/// Why a candidate did not make it into any plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Neither an NCT id nor a local protocol id.
    Unkeyed,
    /// The key cannot name a file inside the trial directory.
    UnsafeKey,
    /// The registry lookup failed; retried next run.
    LookupFailed(String),
    /// `<trial_dir>/<key>.json` does not exist.
    MissingDocument(PathBuf),
    /// The feed closes a trial that can only be matched by local id.
    CloseWithoutNct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub key: Option<TrialKey>,
    pub reason: SkipReason,
}

/// The three disjoint, feed-ordered partitions for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    pub to_insert: Vec<InsertEntry>,
    pub to_update: Vec<UpdateEntry>,
    pub to_close: Vec<CloseEntry>,
    /// Evaluated, already in the desired remote state.
    pub settled: Vec<(TrialKey, NaiveDate)>,
    pub skipped: Vec<Skipped>,
    /// Rows suppressed by the watermark.
    pub unchanged: usize,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty() && self.to_close.is_empty()
    }

    pub fn operation_count(&self) -> usize {
        self.to_insert.len() + self.to_update.len() + self.to_close.len()
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Build the plan for `records`.
pub fn plan(
    records: &[TrialStatusRecord],
    watermark: &WatermarkFile,
    registry: &dyn TrialRegistry,
    trial_dir: &Path,
) -> SyncPlan {
    let mut plan = SyncPlan::default();

    for record in records {
        let Some(key) = record.trial_key() else {
            tracing::warn!(
                status = %record.status,
                updated = %record.last_updated,
                "feed row has no NCT id and no local protocol ids; dropping"
            );
            plan.skipped.push(Skipped {
                key: None,
                reason: SkipReason::Unkeyed,
            });
            continue;
        };

        if !key.is_file_safe() {
            tracing::warn!(key = %key, "trial key is not a plain file name; dropping");
            plan.skipped.push(Skipped {
                key: Some(key),
                reason: SkipReason::UnsafeKey,
            });
            continue;
        }

        if !watermark.needs_sync(&key, record.last_updated) {
            tracing::debug!(key = %key, "unchanged since last sync");
            plan.unchanged += 1;
            continue;
        }

        let query = match &key {
            TrialKey::Nct(nct) => TrialQuery::Nct(nct.clone()),
            TrialKey::Local(_) => TrialQuery::AnyLocalId(record.local_protocol_ids.clone()),
        };
        let remote = match find_first(registry, &query) {
            Ok(remote) => remote,
            Err(err) => {
                tracing::error!(key = %key, error = %err, "registry lookup failed");
                plan.skipped.push(Skipped {
                    key: Some(key),
                    reason: SkipReason::LookupFailed(err.to_string()),
                });
                continue;
            }
        };

        classify(&mut plan, key, record, remote, trial_dir);
    }

    tracing::info!(
        insert = plan.to_insert.len(),
        update = plan.to_update.len(),
        close = plan.to_close.len(),
        unchanged = plan.unchanged,
        skipped = plan.skipped.len(),
        "sync plan ready"
    );
    plan
}

fn classify(
    plan: &mut SyncPlan,
    key: TrialKey,
    record: &TrialStatusRecord,
    remote: Option<RemoteTrial>,
    trial_dir: &Path,
) {
    let Some(remote) = remote else {
        if let Some(file) = document_path(plan, &key, trial_dir) {
            tracing::debug!(key = %key, "not in registry; planning insert");
            plan.to_insert.push(InsertEntry {
                key,
                updated: record.last_updated,
                file,
            });
        }
        return;
    };

    if remote.is_closed() {
        tracing::info!(key = %key, registry_id = %remote.registry_id, "already closed in registry");
        plan.settled.push((key, record.last_updated));
        return;
    }

    if record.status.is_closed() {
        match key {
            TrialKey::Nct(_) => {
                tracing::debug!(key = %key, "planning close");
                plan.to_close.push(CloseEntry {
                    key,
                    updated: record.last_updated,
                    remote,
                });
            }
            TrialKey::Local(_) => {
                tracing::warn!(key = %key, "cannot close a trial matched only by local protocol id");
                plan.skipped.push(Skipped {
                    key: Some(key),
                    reason: SkipReason::CloseWithoutNct,
                });
            }
        }
        return;
    }

    if let Some(file) = document_path(plan, &key, trial_dir) {
        tracing::debug!(key = %key, registry_id = %remote.registry_id, "planning update");
        plan.to_update.push(UpdateEntry {
            key,
            updated: record.last_updated,
            file,
            registry_id: remote.registry_id,
            concurrency_token: remote.concurrency_token,
            protocol_id: remote.protocol_id,
            protocol_no: remote.protocol_no,
        });
    }
}

/// `<trial_dir>/<key>.json`, or `None` (recorded as skipped) when absent.
fn document_path(plan: &mut SyncPlan, key: &TrialKey, trial_dir: &Path) -> Option<PathBuf> {
    let file = trial_dir.join(key.file_name());
    if file.is_file() {
        return Some(file);
    }
    tracing::warn!(key = %key, path = %file.display(), "trial document missing; skipping");
    plan.skipped.push(Skipped {
        key: Some(key.clone()),
        reason: SkipReason::MissingDocument(file),
    });
    None
}
