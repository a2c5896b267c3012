//! Print the recorded history of paths after an event id

use crate::util;
use anyhow::{Context, Result};
use fsevents_watcher::EventStream;
use owo_colors::OwoColorize;
use std::path::PathBuf;

pub async fn run(since: u64, paths: Vec<PathBuf>, device: Option<u64>) -> Result<()> {
    let mut paths: Vec<String> = paths
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    if paths.is_empty() {
        paths.push(".".to_string());
    }

    let service = util::system_service();
    let events = tokio::task::spawn_blocking(move || {
        EventStream::history_since(service, paths, device, since)
    })
    .await
    .context("History query failed")?
    .with_context(|| format!("Failed to read history since {}", since))?;

    for event in &events {
        println!(
            "{:>12} {} {}",
            event.id.dimmed(),
            util::paint_flags(event.flags),
            event.path
        );
    }
    Ok(())
}
