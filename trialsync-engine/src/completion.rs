//! Run completion: the trailing recompute trigger and the watermark commit.

use std::path::Path;

use chrono::Utc;

use crate::client::TrialRegistry;
use crate::error::SyncError;
use crate::executor::RunReport;
use crate::watermark::{self, WatermarkFile};

/// What happened to the recompute signal at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecomputeStatus {
    /// Nothing succeeded, so nothing was sent.
    NotNeeded,
    Triggered,
    /// The signal was sent and failed; the run's mutations stand.
    Failed(String),
}

/// Finish a run.
///
/// Sends the recompute signal once iff `report` has a success, then always
/// writes the full watermark. Only the watermark write can fail the run.
pub fn complete_run(
    registry: &dyn TrialRegistry,
    report: &RunReport,
    watermark: &mut WatermarkFile,
    state_dir: &Path,
) -> Result<RecomputeStatus, SyncError> {
    let recompute = if report.any_success() {
        match registry.trigger_recompute() {
            Ok(()) => {
                tracing::info!("recompute requested");
                RecomputeStatus::Triggered
            }
            Err(err) => {
                tracing::error!(error = %err, "recompute request failed");
                RecomputeStatus::Failed(err.to_string())
            }
        }
    } else {
        tracing::info!("no successful operations; recompute not requested");
        RecomputeStatus::NotNeeded
    };

    watermark.synced_at = Utc::now();
    watermark::save_at(state_dir, watermark)?;
    Ok(recompute)
}
