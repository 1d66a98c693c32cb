//! Best-effort relocation of processed trial documents.
//!
//! 1. `rename` into the archive directory.
//! 2. On a lock-type failure, sleep `policy.delay` and retry, up to
//!    `policy.attempts` renames in total.
//! 3. When every rename failed, fall back to copy-then-delete.
//! 4. If the fallback fails too, return the error. Other rename errors are
//!    returned immediately.

use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use trialsync_core::RelocateConfig;

use crate::error::{io_err, SyncError};

/// Retry parameters for [`relocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocatePolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RelocatePolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl From<&RelocateConfig> for RelocatePolicy {
    fn from(cfg: &RelocateConfig) -> Self {
        Self {
            attempts: cfg.attempts.max(1),
            delay: Duration::from_millis(cfg.delay_ms),
        }
    }
}

/// How a file reached the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocateOutcome {
    /// Renamed on attempt number `attempts` (1-based).
    Renamed { path: PathBuf, attempts: u32 },
    /// Every rename hit a lock; the file was copied and the source removed.
    Copied { path: PathBuf },
}

impl RelocateOutcome {
    pub fn path(&self) -> &Path {
        match self {
            RelocateOutcome::Renamed { path, .. } | RelocateOutcome::Copied { path } => path,
        }
    }
}

/// Move `src` into `archive_dir`, keeping its file name.
pub fn relocate(
    src: &Path,
    archive_dir: &Path,
    policy: RelocatePolicy,
) -> Result<RelocateOutcome, SyncError> {
    relocate_with(src, archive_dir, policy, |from, to| std::fs::rename(from, to))
}

pub(crate) fn relocate_with(
    src: &Path,
    archive_dir: &Path,
    policy: RelocatePolicy,
    mut rename: impl FnMut(&Path, &Path) -> io::Result<()>,
) -> Result<RelocateOutcome, SyncError> {
    let Some(file_name) = src.file_name() else {
        return Err(io_err(
            src,
            io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"),
        ));
    };
    std::fs::create_dir_all(archive_dir).map_err(|e| io_err(archive_dir, e))?;
    let dest = archive_dir.join(file_name);
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        match rename(src, &dest) {
            Ok(()) => {
                tracing::info!(from = %src.display(), to = %dest.display(), "moved");
                return Ok(RelocateOutcome::Renamed {
                    path: dest,
                    attempts: attempt,
                });
            }
            Err(err) if is_lock_error(&err) => {
                if attempt < attempts {
                    tracing::warn!(
                        path = %src.display(),
                        attempt,
                        attempts,
                        error = %err,
                        "file locked, retrying move"
                    );
                    thread::sleep(policy.delay);
                }
            }
            Err(err) => {
                tracing::error!(path = %src.display(), error = %err, "unexpected error moving file");
                return Err(io_err(src, err));
            }
        }
    }

    tracing::info!(path = %src.display(), "rename exhausted, copying instead");
    copy_then_delete(src, &dest)?;
    Ok(RelocateOutcome::Copied { path: dest })
}

fn copy_then_delete(src: &Path, dest: &Path) -> Result<(), SyncError> {
    if let Err(err) = std::fs::copy(src, dest) {
        tracing::error!(path = %src.display(), error = %err, "copy fallback failed");
        return Err(io_err(dest, err));
    }
    std::fs::remove_file(src).map_err(|err| {
        tracing::error!(path = %src.display(), error = %err, "copied but could not remove source");
        io_err(src, err)
    })
}

fn is_lock_error(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::PermissionDenied {
        return true;
    }
    // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
    cfg!(windows) && matches!(err.raw_os_error(), Some(32) | Some(33))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
