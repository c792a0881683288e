//! fleetdeck-replay: offline driver for the resource-graph sync engine.
//!
//! ## Subcommands
//!
//! - `run`: seed a store from a snapshot, replay a JSONL frame log through the
//!   subscription controller, print a JSON report
//! - `check`: audit the snapshot's collections without replaying anything
//!
//! Exits 1 when the resulting graph violates the link invariant.

mod logging;
mod replay;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use fleetdeck_core::{load_sync_config, load_sync_config_from, SyncConfig};

#[derive(Parser)]
#[command(name = "fleetdeck-replay")]
#[command(about = "Replay recorded resource-change frames and audit the graph")]
#[command(version)]
struct Cli {
    /// Sync config file (defaults to ~/.fleetdeck/sync.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to <DIR>/replay.log instead of stderr
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a frame log against a snapshot
    Run {
        /// JSON object of resource arrays keyed by kind
        #[arg(long)]
        snapshot: PathBuf,

        /// One frame per line
        #[arg(long)]
        frames: PathBuf,

        /// Project the subscription is scoped to
        #[arg(long)]
        project: Option<String>,
    },

    /// Audit a snapshot without replaying frames
    Check {
        #[arg(long)]
        snapshot: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _logging_guard = logging::init(cli.log_dir.as_deref());

    match execute(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            tracing::error!(error = %err, "fleetdeck-replay failed");
            eprintln!("{}", err);
            std::process::exit(1);
        }
    }
}

/// Returns whether the audited graph was clean.
async fn execute(cli: Cli) -> Result<bool, String> {
    let config = resolve_config(cli.config.as_deref())?;

    let report = match cli.command {
        Commands::Run {
            snapshot,
            frames,
            project,
        } => {
            let store = replay::load_snapshot(&snapshot)?;
            let frames = replay::read_frames(&frames)?;
            replay::run(store, frames, project.as_deref(), &config).await
        }
        Commands::Check { snapshot } => {
            let store = replay::load_snapshot(&snapshot)?;
            replay::check(store, &config)
        }
    };

    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|err| format!("Failed to render report: {}", err))?;
    println!("{}", rendered);
    Ok(report.is_clean())
}

fn resolve_config(path: Option<&Path>) -> Result<SyncConfig, String> {
    let config = match path {
        Some(path) => load_sync_config_from(path),
        None => load_sync_config(),
    };
    config.map_err(|err| err.to_string())
}
