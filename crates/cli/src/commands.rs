use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value as JsonValue;

use jobforge_core::{EntryId, FailedEntryId};
use jobforge_infra::jobs::{
    EnqueueOptions, FailedEntry, JobManager, ManagerConfig, PostgresQueueStore, QueueEntry,
};
use jobforge_work::JobRegistry;

#[derive(Parser, Debug)]
#[command(name = "jobforge", about = "Inspect and repair the background job queue")]
pub struct Cli {
    /// TOML configuration file; `JOBFORGE_*` variables override it.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Create the queue tables if missing.
    Schema,
    /// Queue counters and the next automatic run.
    Stats,
    /// Show one pending entry.
    Show { id: EntryId },
    /// Entries that should have run a while ago.
    Overdue {
        #[arg(long)]
        manual: bool,
        #[arg(long, default_value_t = 3600)]
        threshold_secs: u64,
    },
    /// Delete a pending entry, by id or unique key.
    Cancel {
        #[arg(required_unless_present = "key", conflicts_with = "key")]
        id: Option<EntryId>,
        #[arg(long)]
        key: Option<String>,
    },
    /// Dead-letter table.
    #[command(subcommand)]
    Failed(FailedCommand),
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum FailedCommand {
    /// Most recent failures first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Re-enqueue a failure with its captured state.
    Replay {
        id: FailedEntryId,
        /// Enqueue as a manual entry instead of an automatic one.
        #[arg(long)]
        manual: bool,
    },
    Delete { id: FailedEntryId },
    /// Drop failures older than the given number of days.
    Prune {
        #[arg(long)]
        older_than_days: u64,
    },
}

/// Pending entry with its state rendered as JSON when possible.
#[derive(Debug, Serialize)]
struct EntryView {
    id: EntryId,
    work_type: String,
    unique_key: Option<String>,
    trigger_at: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    is_manual: bool,
    priority: i32,
    attempts: u32,
    state: JsonValue,
}

impl From<QueueEntry> for EntryView {
    fn from(entry: QueueEntry) -> Self {
        Self {
            state: render_state(&entry.state),
            id: entry.id,
            work_type: entry.work_type,
            unique_key: entry.unique_key,
            trigger_at: entry.trigger_at,
            last_run_at: entry.last_run_at,
            is_manual: entry.is_manual,
            priority: entry.priority,
            attempts: entry.attempts,
        }
    }
}

#[derive(Debug, Serialize)]
struct FailedView {
    id: FailedEntryId,
    work_type: String,
    captured_error: String,
    failed_at: DateTime<Utc>,
    state: JsonValue,
}

impl From<FailedEntry> for FailedView {
    fn from(failed: FailedEntry) -> Self {
        Self {
            state: render_state(&failed.state),
            id: failed.id,
            work_type: failed.work_type,
            captured_error: failed.captured_error,
            failed_at: failed.failed_at,
        }
    }
}

fn render_state(bytes: &[u8]) -> JsonValue {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run an admin command. Blocks on the store's runtime.
pub fn execute(store: PostgresQueueStore, config: ManagerConfig, command: Command) -> Result<()> {
    // no job types: this manager only reads and rewrites rows
    let mut manager = JobManager::new(Arc::new(store), JobRegistry::new(), config);

    match command {
        Command::Schema => bail!("schema is handled before the manager starts"),
        Command::Stats => print_json(&manager.stats()?),
        Command::Show { id } => {
            let entry = manager
                .get(id)?
                .with_context(|| format!("no pending entry {id}"))?;
            print_json(&EntryView::from(entry))
        }
        Command::Overdue {
            manual,
            threshold_secs,
        } => {
            let entries: Vec<EntryView> = manager
                .overdue_entries(manual, Duration::from_secs(threshold_secs))?
                .into_iter()
                .map(EntryView::from)
                .collect();
            print_json(&entries)
        }
        Command::Cancel { id, key } => {
            let deleted = match (id, key) {
                (Some(id), _) => manager.cancel(id)?,
                (None, Some(key)) => manager.cancel_unique(&key)?,
                (None, None) => bail!("either an id or --key is required"),
            };
            print_json(&serde_json::json!({ "deleted": deleted }))
        }
        Command::Failed(FailedCommand::List { limit }) => {
            let failed: Vec<FailedView> = manager
                .failed_entries(limit)?
                .into_iter()
                .map(FailedView::from)
                .collect();
            print_json(&failed)
        }
        Command::Failed(FailedCommand::Replay { id, manual }) => {
            let options = if manual {
                EnqueueOptions::manual()
            } else {
                EnqueueOptions::automatic()
            };
            let entry_id = manager.replay_failed(id, options)?;
            print_json(&serde_json::json!({ "entry_id": entry_id }))
        }
        Command::Failed(FailedCommand::Delete { id }) => {
            let deleted = manager.delete_failed(id)?;
            print_json(&serde_json::json!({ "deleted": deleted }))
        }
        Command::Failed(FailedCommand::Prune { older_than_days }) => {
            let older_than = Duration::from_secs(older_than_days.saturating_mul(24 * 60 * 60));
            let pruned = manager.prune_failed(older_than)?;
            print_json(&serde_json::json!({ "pruned": pruned }))
        }
    }
}
