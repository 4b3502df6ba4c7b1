//! Command-line surface for the RouteSpark daemons and tools.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "routespark",
    about = "Order-cycle scheduling and demand forecasting daemons",
    version
)]
pub struct Cli {
    /// Optional TOML configuration file; env vars override file values.
    #[arg(long, global = true, env = "ROUTESPARK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the retrain orchestrator loop.
    Retrain {
        /// Tick interval in seconds.
        #[arg(long, env = "RETRAIN_INTERVAL_SECONDS")]
        interval: Option<u64>,
        /// Run a single tick and exit.
        #[arg(long)]
        once: bool,
    },

    /// Run the archive export queue worker.
    ExportWorker {
        #[arg(long, env = "EXPORT_POLL_SECONDS")]
        poll_seconds: Option<u64>,
        /// Run one poll/claim/process cycle and exit.
        #[arg(long)]
        once: bool,
    },

    /// Run the archive purge + artifact expiry worker.
    PurgeWorker {
        #[arg(long, env = "PURGE_POLL_SECONDS")]
        poll_seconds: Option<u64>,
        #[arg(long)]
        once: bool,
    },

    /// Run band calibration for routes (weekly cadence unless forced).
    Calibrate {
        /// Comma-separated route list; defaults to all synced routes.
        #[arg(long)]
        routes: Option<String>,
        /// Ignore the weekly cadence gate.
        #[arg(long)]
        force: bool,
    },

    /// Run the walk-forward backtest and write CSV snapshots.
    Backtest {
        /// Comma-separated route list; defaults to all synced routes.
        #[arg(long)]
        routes: Option<String>,
        #[arg(long)]
        output_dir: Option<String>,
        #[arg(long)]
        max_folds: Option<u32>,
        #[arg(long)]
        min_train_orders: Option<u32>,
    },
}

pub fn parse_routes_arg(raw: Option<&str>) -> Option<Vec<String>> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}
