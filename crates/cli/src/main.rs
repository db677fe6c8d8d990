//! `jobforge`: operator tool for the job queue.
//!
//! Inspects and repairs the queue tables. It never runs jobs itself: job
//! types live in the application that embeds the scheduler, and a manager
//! without them would drop every entry it claimed.

mod commands;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use jobforge_infra::config::SchedulerConfig;
use jobforge_infra::jobs::PostgresQueueStore;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = SchedulerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    jobforge_observability::init_with(&config.logging);

    let database_url = config
        .database_url
        .clone()
        .context("database_url is not set (config file, JOBFORGE_DATABASE_URL or DATABASE_URL)")?;
    let store = PostgresQueueStore::connect(&database_url)
        .await
        .context("failed to connect to the queue database")?;

    if matches!(cli.command, Command::Schema) {
        store.ensure_schema().await.context("failed to create queue tables")?;
        info!("queue schema is up to date");
        return Ok(());
    }

    // the store's sync API blocks on the runtime, so it must run off the async workers
    let manager_config = config.manager_config();
    tokio::task::spawn_blocking(move || commands::execute(store, manager_config, cli.command))
        .await
        .context("command task panicked")?
}
