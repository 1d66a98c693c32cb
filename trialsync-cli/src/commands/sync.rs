//! `trialsync sync [--dry-run]`

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use trialsync_engine::planner::{SkipReason, SyncPlan};
use trialsync_engine::{pipeline, HttpRegistry, RecomputeStatus, RunOptions, RunReport};

use super::Session;

/// Arguments for `trialsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Plan against the registry but change nothing.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "trial")]
    key: String,
    #[tabled(rename = "action")]
    action: String,
    #[tabled(rename = "protocol no")]
    protocol_no: String,
    #[tabled(rename = "result")]
    result: String,
}

impl SyncArgs {
    pub fn run(self, explicit: Option<&Path>) -> Result<()> {
        let session = Session::open(explicit)?;
        let registry = HttpRegistry::new(&session.config);
        let options = RunOptions {
            dry_run: self.dry_run,
            ..RunOptions::today()
        };

        let summary = pipeline::run(&session.config, &session.home, &registry, options)
            .context("sync failed")?;

        match &summary.report {
            None => print_plan(&summary.plan),
            Some(report) => print_report(&summary.plan, report, &summary.recompute),
        }
        Ok(())
    }
}

fn print_plan(plan: &SyncPlan) {
    println!(
        "[dry-run] {} to insert, {} to update, {} to close, {} unchanged",
        plan.to_insert.len(),
        plan.to_update.len(),
        plan.to_close.len(),
        plan.unchanged
    );
    for entry in &plan.to_insert {
        println!("  +  {}", entry.key);
    }
    for entry in &plan.to_update {
        println!("  ~  {} ({})", entry.key, entry.registry_id);
    }
    for entry in &plan.to_close {
        println!("  x  {} ({})", entry.key, entry.remote.registry_id);
    }
    print_skipped(plan);
}

fn print_report(plan: &SyncPlan, report: &RunReport, recompute: &RecomputeStatus) {
    if report.outcomes.is_empty() {
        println!("✓ nothing to do ({} unchanged)", plan.unchanged);
        print_skipped(plan);
        return;
    }

    let rows: Vec<OutcomeRow> = report
        .outcomes
        .iter()
        .map(|outcome| OutcomeRow {
            key: outcome.key.to_string(),
            action: outcome.action.to_string(),
            protocol_no: outcome.protocol_no.clone().unwrap_or_default(),
            result: match (&outcome.result, &outcome.archive_error) {
                (Ok(()), None) => "ok".green().to_string(),
                (Ok(()), Some(err)) => format!("{} (not archived: {err})", "ok".yellow()),
                (Err(err), _) => format!("{} {err}", "failed".red()),
            },
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    println!(
        "{} succeeded, {} failed, {} unchanged",
        report.succeeded(),
        report.failed(),
        plan.unchanged
    );
    print_skipped(plan);

    match recompute {
        RecomputeStatus::Triggered => println!("✓ recompute requested"),
        RecomputeStatus::NotNeeded => {}
        RecomputeStatus::Failed(err) => println!("{} recompute request failed: {err}", "!".red()),
    }
}

fn print_skipped(plan: &SyncPlan) {
    for skipped in &plan.skipped {
        let key = skipped
            .key
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "<no key>".to_owned());
        let reason = match &skipped.reason {
            SkipReason::Unkeyed => "no NCT id or local protocol id".to_owned(),
            SkipReason::UnsafeKey => "key is not a plain file name".to_owned(),
            SkipReason::LookupFailed(err) => format!("lookup failed: {err}"),
            SkipReason::MissingDocument(path) => format!("missing {}", path.display()),
            SkipReason::CloseWithoutNct => "closed locally, no NCT id to close by".to_owned(),
        };
        println!("  {}  {key}: {reason}", "·".bright_black());
    }
}
