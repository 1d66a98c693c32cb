//! # trialsync-engine
//!
//! Reconciles a local trial status feed against a remote trial registry.
//!
//! Call [`run`] for a full pass: plan against the watermark, apply inserts,
//! updates and closes, then trigger one recompute and persist the watermark.

pub mod allocator;
pub mod client;
pub mod completion;
pub mod error;
pub mod executor;
pub mod feed;
pub mod pipeline;
pub mod planner;
pub mod relocate;
pub mod watermark;

pub use client::{HttpRegistry, RemoteTrial, TrialQuery, TrialRegistry};
pub use completion::RecomputeStatus;
pub use error::{ClientError, SyncError};
pub use executor::{Action, RunReport, TrialOutcome};
pub use pipeline::{run, RunOptions, RunSummary};
pub use planner::{SkipReason, SyncPlan};
