//! ferry - transactional, undoable file operations.
//!
//! Usage:
//!   ferry run PLAN.json       Execute a plan of transactions and undo/redo steps
//!   ferry trash list          List items in the trash
//!   ferry trash empty --yes   Permanently empty the trash
//!   ferry --help              Show help

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail, eyre};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use ferry_core::{EngineConfig, TransactionId};
use ferry_ops::{
    ConflictAction, EngineEvent, FixedResolver, LocalFs, Operation,
    ResultDescriptor, TransactionManager, TransactionStatus,
};

#[derive(Parser)]
#[command(
    name = "ferry",
    version,
    about = "Transactional, undoable file operations",
    long_about = "ferry runs batches of file operations as transactions.\n\n\
                  Every completed transaction can be undone and redone, \
                  destination conflicts are resolved by policy and failures \
                  stay isolated to the job that hit them."
)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log engine activity to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a JSON plan
    Run {
        /// Plan file
        plan: PathBuf,

        /// What to do when a destination already exists
        #[arg(long, default_value = "skip")]
        on_conflict: ConflictPolicy,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Inspect or empty the trash
    Trash {
        #[command(subcommand)]
        command: TrashCommand,
    },
}

#[derive(Subcommand)]
enum TrashCommand {
    /// List trashed items
    List {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Permanently delete everything in the trash
    Empty {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum ConflictPolicy {
    #[default]
    Skip,
    Overwrite,
    Rename,
    Cancel,
}

impl From<ConflictPolicy> for ConflictAction {
    fn from(policy: ConflictPolicy) -> Self {
        match policy {
            ConflictPolicy::Skip => ConflictAction::Skip,
            ConflictPolicy::Overwrite => ConflictAction::Overwrite,
            ConflictPolicy::Rename => ConflictAction::Rename,
            ConflictPolicy::Cancel => ConflictAction::CancelAll,
        }
    }
}

/// A plan file: steps executed in order.
#[derive(Debug, Deserialize)]
struct Plan {
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Step {
    History(HistoryStep),
    Transaction {
        description: String,
        operations: Vec<Operation>,
    },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum HistoryStep {
    Undo,
    Redo,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            plan,
            on_conflict,
            format,
        } => run_plan(&plan, config, on_conflict, format).await,
        Command::Trash {
            command: TrashCommand::List { format },
        } => list_trash(config, format),
        Command::Trash {
            command: TrashCommand::Empty { yes },
        } => {
            if !yes {
                bail!("Emptying the trash cannot be undone; pass --yes to confirm");
            }
            empty_trash(config).await
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("ferry=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: EngineConfig = serde_json::from_str(&text)
        .with_context(|| format!("Invalid config {}", path.display()))?;
    config
        .validate()
        .map_err(|reason| eyre!("Invalid config {}: {reason}", path.display()))?;
    Ok(config)
}

/// Execute every step of a plan file.
async fn run_plan(
    path: &Path,
    config: EngineConfig,
    policy: ConflictPolicy,
    format: OutputFormat,
) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    let plan: Plan = serde_json::from_str(&text).context("Invalid plan")?;

    let mut manager = TransactionManager::new(Arc::new(LocalFs::new()), config);
    manager.set_conflict_resolver(FixedResolver(policy.into()));
    let mut events = manager.subscribe();

    let mut failed = 0;
    for step in plan.steps {
        let id = match step {
            Step::Transaction {
                description,
                operations,
            } => {
                let id = manager.start_transaction(description);
                for operation in operations {
                    manager
                        .add_operation(id, operation)
                        .context("Invalid operation in plan")?;
                }
                manager.commit(id)?;
                id
            }
            Step::History(HistoryStep::Undo) => manager.undo().context("Undo failed")?,
            Step::History(HistoryStep::Redo) => manager.redo().context("Redo failed")?,
        };

        manager.run_until_idle().await;
        report(&manager, id, &mut events, format)?;
        if manager
            .transaction(id)
            .is_some_and(|t| t.status() == TransactionStatus::Failed)
        {
            failed += 1;
        }
    }

    if let OutputFormat::Text = format {
        match manager.undo_description() {
            Some(label) => println!("Next: {label}"),
            None => println!("Nothing to undo"),
        }
    }
    if failed > 0 {
        bail!("{failed} transaction(s) failed");
    }
    Ok(())
}

/// Print what happened during one step.
fn report(
    manager: &TransactionManager,
    id: TransactionId,
    events: &mut broadcast::Receiver<EngineEvent>,
    format: OutputFormat,
) -> Result<()> {
    let drained = drain(events);
    match format {
        OutputFormat::Json => {
            for event in &drained {
                println!("{}", serde_json::to_string(event)?);
            }
        }
        OutputFormat::Text => {
            for event in &drained {
                match event {
                    EngineEvent::TransactionStarted {
                        description,
                        total_ops,
                        ..
                    } => println!("{description} ({total_ops} operations)"),
                    EngineEvent::JobError { path, message, .. } => {
                        println!("  ✗ {}: {message}", path.display());
                    }
                    EngineEvent::JobCompleted {
                        path,
                        result: ResultDescriptor::Partial { skipped },
                        ..
                    } => println!("  ! {}: {skipped} entries skipped", path.display()),
                    EngineEvent::JobCompleted {
                        path,
                        result_path: Some(result_path),
                        result: ResultDescriptor::Success,
                        ..
                    } if result_path != path => {
                        println!("  {} → {}", path.display(), result_path.display());
                    }
                    _ => {}
                }
            }
            if let Some(txn) = manager.transaction(id) {
                println!(
                    "  {} [{}] {}",
                    txn.summary(),
                    txn.status(),
                    format_size(txn.bytes_done())
                );
            }
        }
    }
    Ok(())
}

fn drain(events: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                tracing::warn!(target: "ferry::cli", missed, "Event receiver lagged");
            }
            Err(_) => break,
        }
    }
    drained
}

/// List trashed items, newest first.
fn list_trash(config: EngineConfig, format: OutputFormat) -> Result<()> {
    let manager = TransactionManager::new(Arc::new(LocalFs::new()), config);
    let items = manager
        .trash_items()
        .context("Failed to read the trash")?;

    match format {
        OutputFormat::Text => {
            if items.is_empty() {
                println!("Trash is empty");
            }
            for item in &items {
                let deleted = chrono::DateTime::from_timestamp(item.deleted_at, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                println!("{deleted}  {}", item.original_path.display());
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
    }
    Ok(())
}

/// Empty the trash through the engine so it is reported like any other job.
async fn empty_trash(config: EngineConfig) -> Result<()> {
    let mut manager = TransactionManager::new(Arc::new(LocalFs::new()), config);
    let id = manager.start_transaction("Empty trash");
    manager.add_operation(id, Operation::empty_trash())?;
    manager.commit(id)?;
    manager.run_until_idle().await;

    let Some(txn) = manager.transaction(id) else {
        bail!("Transaction {id} was lost");
    };
    if let Some(error) = txn.jobs().find_map(|j| j.error.as_ref()) {
        bail!("Failed to empty the trash: {}", error.message);
    }
    println!("Trash emptied");
    Ok(())
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}
