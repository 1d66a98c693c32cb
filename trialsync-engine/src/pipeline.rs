//! Shared sync pipeline entrypoint used by the CLI.
//!
//! 1. Check that the trial directory and status feed exist.
//! 2. Load the watermark.
//! 3. Read the feed and build a [`SyncPlan`].
//! 4. Execute it (skipped with `dry_run`).
//! 5. Complete the run: one recompute trigger, one watermark write.
//!
//! Steps 1 to 3 fail the whole run. From step 4 on, failures are per trial.

use std::path::Path;

use chrono::NaiveDate;

use trialsync_core::SyncConfig;

use crate::client::TrialRegistry;
use crate::completion::{complete_run, RecomputeStatus};
use crate::error::SyncError;
use crate::executor::{Executor, RunReport};
use crate::feed::read_feed;
use crate::planner::{plan, SyncPlan};
use crate::relocate::RelocatePolicy;
use crate::watermark;

/// Per-run knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Local calendar day used for protocol numbers.
    pub today: NaiveDate,
    /// Plan only; no remote mutation and no state written.
    pub dry_run: bool,
}

impl RunOptions {
    pub fn today() -> Self {
        Self {
            today: chrono::Local::now().date_naive(),
            dry_run: false,
        }
    }
}

/// Everything a caller needs to report on a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub plan: SyncPlan,
    /// `None` for dry runs.
    pub report: Option<RunReport>,
    pub recompute: RecomputeStatus,
}

/// Run one synchronization pass.
pub fn run(
    config: &SyncConfig,
    home: &Path,
    registry: &dyn TrialRegistry,
    options: RunOptions,
) -> Result<RunSummary, SyncError> {
    check_inputs(config)?;

    let state_dir = config.state_dir_at(home);
    let mut store = watermark::load_at(&state_dir)?;
    let records = read_feed(&config.status_file)?;
    tracing::info!(
        feed = %config.status_file.display(),
        rows = records.len(),
        tracked = store.trials.len(),
        "starting sync"
    );

    let sync_plan = plan(&records, &store, registry, &config.trial_dir);

    if options.dry_run {
        tracing::info!(operations = sync_plan.operation_count(), "dry run; nothing applied");
        return Ok(RunSummary {
            plan: sync_plan,
            report: None,
            recompute: RecomputeStatus::NotNeeded,
        });
    }

    let mut executor = Executor::new(
        registry,
        &state_dir,
        &config.archive_dir,
        RelocatePolicy::from(&config.relocate),
        options.today,
    );
    let report = executor.execute(sync_plan.clone(), &mut store);
    let recompute = complete_run(registry, &report, &mut store, &state_dir)?;

    Ok(RunSummary {
        plan: sync_plan,
        report: Some(report),
        recompute,
    })
}

fn check_inputs(config: &SyncConfig) -> Result<(), SyncError> {
    if !config.trial_dir.is_dir() {
        return Err(SyncError::Missing {
            what: "trial directory",
            path: config.trial_dir.clone(),
        });
    }
    if !config.status_file.is_file() {
        return Err(SyncError::Missing {
            what: "status feed",
            path: config.status_file.clone(),
        });
    }
    Ok(())
}
