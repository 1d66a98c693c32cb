//! `trialsync trial …`: single-trial maintenance against the registry.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use serde_json::Value;

use trialsync_engine::allocator::{self, ProtocolEnvState};
use trialsync_engine::client::{self, find_first, strip_server_fields, TrialQuery, TrialRegistry};
use trialsync_engine::executor::load_document;
use trialsync_engine::HttpRegistry;

use super::Session;

#[derive(Subcommand, Debug)]
pub enum TrialCommand {
    /// Print one trial as JSON.
    Get(ProtocolNoArg),

    /// Replace a trial's document from a JSON file, then request a recompute.
    Update(UpdateArgs),

    /// Print the highest protocol_id and its protocol_no.
    MaxIds,

    /// List every NCT id in the registry.
    NctIds(NctIdsArgs),

    /// Create the protocol environment from the registry maximum.
    SeedEnv(SeedEnvArgs),
}

#[derive(Args, Debug)]
pub struct ProtocolNoArg {
    #[arg(long)]
    pub protocol_no: String,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    #[arg(long)]
    pub protocol_no: String,

    /// JSON document to send.
    #[arg(long)]
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct NctIdsArgs {
    /// Write one id per line to this file instead of stdout.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SeedEnvArgs {
    /// Replace an existing protocol environment.
    #[arg(long)]
    pub force: bool,
}

pub fn run(cmd: TrialCommand, explicit: Option<&Path>) -> Result<()> {
    let session = Session::open(explicit)?;
    let registry = HttpRegistry::new(&session.config);
    match cmd {
        TrialCommand::Get(args) => get(&registry, &args.protocol_no),
        TrialCommand::Update(args) => update(&registry, &args),
        TrialCommand::MaxIds => max_ids(&registry),
        TrialCommand::NctIds(args) => nct_ids(&registry, args.output.as_deref()),
        TrialCommand::SeedEnv(args) => seed_env(&registry, &session.state_dir(), args.force),
    }
}

fn get(registry: &dyn TrialRegistry, protocol_no: &str) -> Result<()> {
    let trial = find_first(registry, &TrialQuery::ProtocolNo(protocol_no.to_owned()))
        .with_context(|| format!("lookup of protocol_no {protocol_no} failed"))?
        .with_context(|| format!("no trial with protocol_no {protocol_no}"))?;
    println!("{}", serde_json::to_string_pretty(&Value::Object(trial.document))?);
    Ok(())
}

fn update(registry: &dyn TrialRegistry, args: &UpdateArgs) -> Result<()> {
    let mut document = load_document(&args.file)?;
    strip_server_fields(&mut document);

    let trial = find_first(registry, &TrialQuery::ProtocolNo(args.protocol_no.clone()))
        .with_context(|| format!("lookup of protocol_no {} failed", args.protocol_no))?
        .with_context(|| format!("no trial with protocol_no {}", args.protocol_no))?;

    registry
        .replace(&trial.registry_id, &trial.concurrency_token, &document)
        .with_context(|| format!("update of {} failed", trial.registry_id))?;
    println!("✓ Updated {} ({})", args.protocol_no, trial.registry_id);

    if let Err(err) = registry.trigger_recompute() {
        tracing::error!(error = %err, "recompute request failed");
    }
    Ok(())
}

fn max_ids(registry: &dyn TrialRegistry) -> Result<()> {
    match client::max_protocol(registry).context("could not list protocol ids")? {
        Some((id, no)) => println!(
            "protocol_id: {id}\nprotocol_no: {}",
            no.as_deref().unwrap_or("-")
        ),
        None => println!("No trials carry a protocol_id."),
    }
    Ok(())
}

fn nct_ids(registry: &dyn TrialRegistry, output: Option<&Path>) -> Result<()> {
    let ids = client::nct_ids(registry).context("could not list NCT ids")?;
    let Some(path) = output else {
        for id in &ids {
            println!("{id}");
        }
        return Ok(());
    };

    let mut body = String::new();
    for id in &ids {
        let _ = writeln!(body, "{id}");
    }
    std::fs::write(path, body).with_context(|| format!("cannot write {}", path.display()))?;
    println!("✓ Wrote {} NCT ids to {}", ids.len(), path.display());
    Ok(())
}

fn seed_env(registry: &dyn TrialRegistry, state_dir: &Path, force: bool) -> Result<()> {
    let path = allocator::state_path_at(state_dir);
    if path.exists() && !force {
        bail!(
            "protocol environment already exists at {}; pass --force to replace it",
            path.display()
        );
    }

    let state = match client::max_protocol(registry).context("could not list protocol ids")? {
        Some((id, no)) => ProtocolEnvState::seeded(id, no.as_deref()),
        None => ProtocolEnvState::seeded(0, None),
    };
    allocator::save_at(state_dir, &state)?;
    println!(
        "✓ Seeded {} (protocol_id {}, last protocol_no {})",
        path.display(),
        state.protocol_id_counter,
        state.protocol_no.as_deref().unwrap_or("-")
    );
    Ok(())
}
