//! Watch paths and print their events until interrupted

use crate::util;
use anyhow::{Context, Result};
use clap::Args;
use fsevents_watcher::{CreateFlags, EventStream, StreamConfig};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Args, Debug, Default)]
pub struct WatchArgs {
    /// Paths to watch (default: current directory)
    pub paths: Vec<PathBuf>,

    /// Load stream settings from a TOML file; flags below override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Coalescing window in milliseconds
    #[arg(long)]
    pub latency_ms: Option<u64>,

    /// Resume after this event id instead of starting from now
    #[arg(long)]
    pub since: Option<u64>,

    /// Only report changes on this device
    #[arg(long)]
    pub device: Option<u64>,

    /// Report individual files instead of directories
    #[arg(long)]
    pub file_events: bool,

    /// Deliver the first change of a burst immediately
    #[arg(long)]
    pub no_defer: bool,

    /// Report changes to the directories leading to the watched paths
    #[arg(long)]
    pub watch_root: bool,

    /// Skip changes made by this process
    #[arg(long)]
    pub ignore_self: bool,
}

/// File settings first, then command-line overrides
pub fn build_config(args: &WatchArgs) -> Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => StreamConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StreamConfig::default(),
    };

    if !args.paths.is_empty() {
        config.paths = args
            .paths
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect();
    }
    if config.paths.is_empty() {
        config.paths.push(".".to_string());
    }
    if let Some(ms) = args.latency_ms {
        config.latency = Duration::from_millis(ms);
    }
    if let Some(id) = args.since {
        config.resume = true;
        config.event_id = id;
    }
    if let Some(device) = args.device {
        config.device = Some(device);
    }

    for (enabled, flag) in [
        (args.file_events, CreateFlags::FILE_EVENTS),
        (args.no_defer, CreateFlags::NO_DEFER),
        (args.watch_root, CreateFlags::WATCH_ROOT),
        (args.ignore_self, CreateFlags::IGNORE_SELF),
    ] {
        if enabled {
            config.flags = config.flags.with(flag);
        }
    }
    Ok(config)
}

pub async fn run(args: WatchArgs) -> Result<()> {
    // 1. Resolve settings
    let config = build_config(&args)?;
    debug!(?config, "Watch configuration");

    // 2. Start the stream
    let service = util::watching_service(&config.paths)?;
    let stream = Arc::new(EventStream::new(config, service));
    let rx = stream.events();
    stream.start().context("Failed to start event stream")?;

    for error in stream.take_path_errors() {
        eprintln!("{} {}", "warning:".yellow().bold(), error);
    }
    println!(
        "{} {} (from event {})",
        "Watching".bold(),
        stream.paths().join(", ").cyan(),
        stream.event_id()
    );

    // 3. Print events until the stream closes
    let printer = tokio::task::spawn_blocking(move || {
        let mut count = 0usize;
        for batch in rx.iter() {
            for event in batch {
                println!(
                    "{:>12} {} {}",
                    event.id.dimmed(),
                    util::paint_flags(event.flags),
                    event.path
                );
                count += 1;
            }
        }
        count
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    // 4. Drain held events, then stop
    let stopping = Arc::clone(&stream);
    tokio::task::spawn_blocking(move || {
        stopping.flush(true);
        stopping.stop();
    })
    .await
    .context("Failed to stop event stream")?;

    let count = printer.await.context("Event printer failed")?;
    println!();
    println!(
        "{} events; resume with {}",
        count,
        format!("--since {}", stream.event_id()).green()
    );
    Ok(())
}
