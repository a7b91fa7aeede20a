//! devrec - device identity reconciliation CLI
//!
//! Feeds manufacturer poll results through the reconciler and exposes the
//! discovery queue and movement log to reviewers. Results are printed to
//! stdout as JSON; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use devrec_common::config::{load_or_default, resolve_root_folder};
use devrec_common::db::init_database;
use devrec_common::EventBus;
use devrec_engine::commands::{ApproveCommand, MarkDuplicateCommand, RejectCommand, ReviewCommand};
use devrec_engine::models::{MovementFilter, QueueFilter};
use devrec_engine::{Reconciler, SqliteRegistry};

/// Command-line arguments for devrec
#[derive(Parser, Debug)]
#[command(name = "devrec")]
#[command(about = "Device identity reconciliation engine")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "DEVREC_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder holding the database (overrides env and config)
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile poll results read from a JSON file
    ///
    /// With --manufacturer the file holds an array of payloads; without it
    /// the file maps manufacturer names to payload arrays and every cycle
    /// runs in parallel.
    Ingest {
        #[arg(short, long)]
        manufacturer: Option<String>,

        #[arg(short, long)]
        file: PathBuf,
    },

    /// Inspect and decide discovery queue entries
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Inspect and acknowledge device movements
    Movements {
        #[command(subcommand)]
        action: MovementAction,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// Pending entries, oldest first
    List {
        #[arg(long)]
        manufacturer: Option<String>,

        #[arg(long)]
        ip_conflict: Option<bool>,

        #[arg(long)]
        manufacturer_mismatch: Option<bool>,
    },
    /// One entry by id
    Show { id: Uuid },
    /// Entry count per status
    Counts,
    /// Approve and import an entry
    Approve(Decision),
    /// Reject an entry
    Reject(Decision),
    /// Close an entry as a repeat report of a known device
    Duplicate(Decision),
}

#[derive(Args, Debug)]
struct Decision {
    id: Uuid,

    #[arg(long, env = "DEVREC_REVIEWER")]
    reviewer: String,

    /// Revision the decision was based on
    #[arg(long)]
    revision: Option<i64>,
}

#[derive(Subcommand, Debug)]
enum MovementAction {
    /// Unacknowledged movements, oldest first
    List {
        #[arg(long)]
        manufacturer: Option<String>,

        #[arg(long)]
        device: Option<Uuid>,
    },
    /// Full movement history of one device
    History { device: Uuid },
    /// Acknowledge a movement
    Ack {
        id: Uuid,

        #[arg(long, env = "DEVREC_REVIEWER")]
        reviewer: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_or_default(cli.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let root_folder = resolve_root_folder(cli.root_folder.as_deref(), &config);
    let db_path = config.database_path(&root_folder);
    info!("Database: {}", db_path.display());

    let db = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let registry = Arc::new(SqliteRegistry::new(db.clone()));
    let reconciler = Arc::new(Reconciler::new(
        db,
        registry,
        EventBus::default(),
        config.reconcile.clone(),
    ));

    match cli.command {
        Command::Ingest { manufacturer, file } => ingest(&reconciler, manufacturer, file).await,
        Command::Queue { action } => queue(&reconciler, action).await,
        Command::Movements { action } => movements(&reconciler, action).await,
    }
}

async fn ingest(reconciler: &Arc<Reconciler>, manufacturer: Option<String>, file: PathBuf) -> Result<()> {
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let parsed: Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;

    let cycles = match (manufacturer, parsed) {
        (Some(manufacturer), Value::Array(payloads)) => vec![(manufacturer, payloads)],
        (None, Value::Object(by_manufacturer)) => {
            let mut cycles = Vec::with_capacity(by_manufacturer.len());
            for (manufacturer, payloads) in by_manufacturer {
                match payloads {
                    Value::Array(payloads) => cycles.push((manufacturer, payloads)),
                    _ => bail!("payloads for {} must be a JSON array", manufacturer),
                }
            }
            cycles
        }
        (Some(_), _) => bail!("with --manufacturer the file must hold a JSON array of payloads"),
        (None, _) => bail!("without --manufacturer the file must map manufacturers to payload arrays"),
    };

    let reports = reconciler.process_cycles(cycles).await;
    print_json(&reports)
}

async fn queue(reconciler: &Reconciler, action: QueueAction) -> Result<()> {
    let queue = reconciler.queue();

    match action {
        QueueAction::List {
            manufacturer,
            ip_conflict,
            manufacturer_mismatch,
        } => {
            let filter = QueueFilter {
                manufacturer,
                ip_conflict,
                manufacturer_mismatch,
            };
            print_json(&queue.list_pending(&filter).await?)
        }
        QueueAction::Show { id } => match queue.get(id).await? {
            Some(entry) => print_json(&entry),
            None => bail!("queue entry {} not found", id),
        },
        QueueAction::Counts => print_json(&queue.counts().await?),
        QueueAction::Approve(decision) => {
            let mut cmd = ApproveCommand::new(decision.id, decision.reviewer);
            cmd.expected_revision = decision.revision;
            review(reconciler, ReviewCommand::Approve(cmd)).await
        }
        QueueAction::Reject(decision) => {
            let mut cmd = RejectCommand::new(decision.id, decision.reviewer);
            cmd.expected_revision = decision.revision;
            review(reconciler, ReviewCommand::Reject(cmd)).await
        }
        QueueAction::Duplicate(decision) => {
            let mut cmd = MarkDuplicateCommand::new(decision.id, decision.reviewer);
            cmd.expected_revision = decision.revision;
            review(reconciler, ReviewCommand::MarkDuplicate(cmd)).await
        }
    }
}

async fn review(reconciler: &Reconciler, command: ReviewCommand) -> Result<()> {
    let entry_id = command.entry_id();
    let outcome = command
        .execute(reconciler.queue())
        .await
        .with_context(|| format!("Review of queue entry {} failed", entry_id))?;
    print_json(&outcome)
}

async fn movements(reconciler: &Reconciler, action: MovementAction) -> Result<()> {
    let log = reconciler.movement_log();

    match action {
        MovementAction::List {
            manufacturer,
            device,
        } => {
            let filter = MovementFilter {
                manufacturer,
                device_id: device,
            };
            print_json(&log.list_unacknowledged(&filter).await?)
        }
        MovementAction::History { device } => print_json(&log.history(device).await?),
        MovementAction::Ack { id, reviewer } => print_json(&log.acknowledge(id, &reviewer).await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
