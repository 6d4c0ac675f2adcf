//! lbsync: offline planning and simulation for load balancer target
//! attachments.
//!
//! - `plan` diffs a desired attachment document against an observed one and
//!   prints the chunks a reconcile would send
//! - `simulate` runs the full reconciler against an in-memory control plane
//! - `config` prints the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lbsync::batch::{self, PlannedChunk};
use lbsync::diff::{diff, TargetDiff};
use lbsync::error::ChunkReport;
use lbsync::model::AttachmentDocument;
use lbsync::{
    AttachmentReconciler, AttachmentSpec, InMemoryLoadBalancer, Reconciler, SerializationGate,
    SyncConfig, TargetSet,
};
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "lbsync", version)]
#[command(about = "Load balancer target attachment reconciliation", long_about = None)]
struct Cli {
    /// JSON config file (defaults apply to missing fields)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the chunks needed to turn the observed attachment into the desired one
    Plan {
        /// Desired attachment document
        #[arg(long)]
        desired: PathBuf,

        /// Observed attachment document
        #[arg(long)]
        observed: PathBuf,

        /// Targets per mutating call (overrides the config file)
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Reconcile against an in-memory control plane seeded with the observed state
    Simulate {
        /// Desired attachment document
        #[arg(long)]
        desired: PathBuf,

        /// Observed attachment document (empty attachment if omitted)
        #[arg(long)]
        observed: Option<PathBuf>,

        /// Targets per mutating call (overrides the config file)
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Polls each simulated task needs before it succeeds (0 = synchronous)
        #[arg(long, default_value = "1")]
        task_polls: u32,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "SCOPE")]
    scope: String,
    #[tabled(rename = "OP")]
    op: String,
    #[tabled(rename = "CHUNK")]
    chunk: usize,
    #[tabled(rename = "SIZE")]
    size: usize,
    #[tabled(rename = "TARGETS")]
    targets: String,
}

impl PlanRow {
    fn new(spec: &AttachmentSpec, chunk: &PlannedChunk) -> Self {
        Self {
            scope: spec.scope.to_string(),
            op: chunk.op.to_string(),
            chunk: chunk.index,
            size: chunk.targets.len(),
            targets: chunk
                .targets
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

#[derive(Tabled)]
struct ChunkRow {
    #[tabled(rename = "OP")]
    op: String,
    #[tabled(rename = "CHUNK")]
    chunk: usize,
    #[tabled(rename = "DISPATCHED")]
    dispatched: usize,
    #[tabled(rename = "ABSENT")]
    absent: usize,
    #[tabled(rename = "TASK")]
    task: String,
    #[tabled(rename = "POLLS")]
    polls: u32,
}

impl From<&ChunkReport> for ChunkRow {
    fn from(report: &ChunkReport) -> Self {
        Self {
            op: report.op.to_string(),
            chunk: report.index,
            dispatched: report.dispatched.len(),
            absent: report.already_absent.len(),
            task: report
                .task
                .as_ref()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            polls: report.polls,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "lbsync=info",
        1 => "lbsync=debug",
        _ => "lbsync=trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Plan {
            desired,
            observed,
            chunk_size,
        } => {
            let config = with_chunk_size(config, chunk_size)?;
            let desired = read_document(&desired)?;
            let observed = read_document(&observed)?;
            print_plan(&desired, &observed, config.chunk_size);
        }

        Commands::Simulate {
            desired,
            observed,
            chunk_size,
            task_polls,
        } => {
            let config = with_chunk_size(config, chunk_size)?;
            let desired = read_document(&desired)?;
            let observed = match observed {
                Some(path) => read_document(&path)?,
                None => AttachmentSpec::new(desired.scope.clone(), TargetSet::new()),
            };
            simulate(&config, &desired, &observed, task_polls).await?;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(SyncConfig::default()),
    }
}

fn with_chunk_size(mut config: SyncConfig, chunk_size: Option<usize>) -> Result<SyncConfig> {
    if let Some(n) = chunk_size {
        config.chunk_size = n;
        config.validate().context("Invalid --chunk-size")?;
    }
    Ok(config)
}

fn read_document(path: &Path) -> Result<AttachmentSpec> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let doc: AttachmentDocument = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    AttachmentSpec::try_from(doc).with_context(|| format!("Invalid attachment in {}", path.display()))
}

fn print_plan(desired: &AttachmentSpec, observed: &AttachmentSpec, chunk_size: usize) {
    let mut rows = Vec::new();

    if observed.scope.requires_replace(&desired.scope) {
        println!(
            "Scope changed ({} -> {}): old attachment is drained first",
            observed.scope, desired.scope
        );
        let drain = TargetDiff {
            remove: observed.targets.to_vec(),
            ..Default::default()
        };
        rows.extend(
            batch::plan(&drain, chunk_size)
                .iter()
                .map(|c| PlanRow::new(observed, c)),
        );
        rows.extend(
            batch::plan(&diff(&desired.targets, &TargetSet::new()), chunk_size)
                .iter()
                .map(|c| PlanRow::new(desired, c)),
        );
    } else {
        rows.extend(
            batch::plan(&diff(&desired.targets, &observed.targets), chunk_size)
                .iter()
                .map(|c| PlanRow::new(desired, c)),
        );
    }

    if rows.is_empty() {
        println!("Attachment {} is up to date", desired.scope);
    } else {
        println!("{}", Table::new(rows));
    }
}

async fn simulate(
    config: &SyncConfig,
    desired: &AttachmentSpec,
    observed: &AttachmentSpec,
    task_polls: u32,
) -> Result<()> {
    let api = Arc::new(
        InMemoryLoadBalancer::new()
            .with_chunk_limit(config.chunk_size)
            .with_task_polls(task_polls),
    );
    api.seed(&observed.scope, &observed.targets).await;

    let gate = Arc::new(SerializationGate::new(config.gate_scope));
    let reconciler = AttachmentReconciler::new(Arc::clone(&api), gate, config)?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling reconciliation");
            trigger.cancel();
        }
    });

    let status = if observed.scope.requires_replace(&desired.scope) {
        reconciler.replace(observed, desired, &cancel).await?
    } else {
        reconciler.reconcile(desired, &cancel).await?
    };

    info!(run_id = %status.run_id, phase = ?status.phase, "Simulation finished");

    if !status.chunks.is_empty() {
        let rows: Vec<ChunkRow> = status.chunks.iter().map(ChunkRow::from).collect();
        println!("{}", Table::new(rows));
    }
    println!(
        "{}: {} added, {} removed, {} re-weighted, {} already absent ({:?})",
        status.scope,
        status.added,
        status.removed,
        status.updated,
        status.already_absent.len(),
        status.phase
    );
    if let Some(message) = &status.message {
        println!("{}", message);
    }

    let calls = api.mutation_calls().await.len();
    println!("{} mutating call(s) issued", calls);
    Ok(())
}
