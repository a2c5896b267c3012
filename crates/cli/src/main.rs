//! fsw - watch filesystem changes through the FSEvents bridge

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

mod cmd;
mod util;

/// Stream filesystem change events with resumable checkpoints
#[derive(Parser)]
#[command(name = "fsw")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log lifecycle details
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print events for paths until interrupted
    Watch(cmd::watch::WatchArgs),
    /// Print the most recent event id issued system-wide
    Latest,
    /// Print the device number (and history UUID) of a path
    Device {
        /// Path on the device to inspect
        path: PathBuf,
    },
    /// Print what was recorded for paths after an event id
    History {
        /// Event id to replay after
        since: u64,
        /// Paths to query (default: current directory)
        paths: Vec<PathBuf>,
        /// Only report changes on this device
        #[arg(long)]
        device: Option<u64>,
    },
    /// Print the last event id on a device before a point in time
    Before {
        /// Device number, as printed by `fsw device`
        device: u64,
        /// Seconds since the Unix epoch
        unix_seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Watch(args) => cmd::watch::run(args).await,
        Commands::Latest => cmd::latest::run().await,
        Commands::Device { path } => cmd::device::run(&path).await,
        Commands::History { since, paths, device } => cmd::history::run(since, paths, device).await,
        Commands::Before { device, unix_seconds } => cmd::before::run(device, unix_seconds).await,
    }
}
