//! `loto-sync`: administrative commands for the LOTO replication layer.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use loto_sync_config::AppConfig;
use loto_sync_core::{PurgeSelection, Replicator};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "loto-sync", version, about = "LOTO replication maintenance")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the remote store and show queued offline writes
    Status,
    /// Lock capacity derived from breaker state
    Stats,
    /// Recompute every lock's usage from breakers
    Reconcile,
    /// Push queued offline writes to the remote store
    Replay,
    /// Delete the contents of the selected tables
    Purge {
        /// Table to purge; repeat for several
        #[arg(long = "table", short, required = true)]
        tables: Vec<String>,
        /// Confirm the purge
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging.level)?;
    tracing::debug!(command = ?cli.command, remote = %config.remote.url, "Starting");

    let replicator = Replicator::open(&config).context("opening replicated store")?;

    match cli.command {
        Command::Status => {
            let online = replicator.monitor().probe(true).await;
            let pending = replicator.pending().len().await?;
            println!("remote:  {}", config.remote.url);
            println!("state:   {}", if online { "online" } else { "offline" });
            println!("pending: {}", pending);
        }
        Command::Stats => print_json(&replicator.lock_stats().await)?,
        Command::Reconcile => {
            let report = replicator
                .reconcile_locks()
                .await
                .context("reconciling lock usage")?;
            print_json(&report)?;
        }
        Command::Replay => {
            let report = replicator
                .replay_pending()
                .await
                .context("replaying offline writes")?;
            print_json(&report)?;
            if !report.is_complete() {
                bail!("{} writes still queued", report.remaining);
            }
        }
        Command::Purge { tables, yes } => {
            let selection = PurgeSelection::from_names(&tables)?;
            if !yes {
                bail!(
                    "refusing to purge {} without --yes",
                    tables.join(", ")
                );
            }
            let report = replicator.purge(&selection).await;
            print_json(&report)?;
            if report.total_failed() > 0 {
                bail!("{} deletions failed", report.total_failed());
            }
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)
            .with_context(|| format!("invalid log level '{}'", default_level))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
