//! Shared helpers for CLI commands

use anyhow::{Context, Result};
use fsevents_watcher::{EventFlags, NativeService};
use owo_colors::OwoColorize;
use std::sync::Arc;

/// Service for queries that do not watch anything
#[cfg(target_os = "macos")]
pub fn system_service() -> Arc<dyn NativeService> {
    Arc::new(fsevents_watcher::FsEventsService::new())
}

#[cfg(not(target_os = "macos"))]
pub fn system_service() -> Arc<dyn NativeService> {
    Arc::new(fsevents_watcher::EmulatedService::new())
}

/// Service that reports changes under `paths`
#[cfg(target_os = "macos")]
pub fn watching_service(_paths: &[String]) -> Result<Arc<dyn NativeService>> {
    Ok(system_service())
}

/// Service that reports changes under `paths`
///
/// Without FSEvents the emulated service observes each path through
/// `notify`; its history only covers this process.
#[cfg(not(target_os = "macos"))]
pub fn watching_service(paths: &[String]) -> Result<Arc<dyn NativeService>> {
    let service = fsevents_watcher::EmulatedService::new();
    for path in paths {
        let root = std::path::absolute(path)
            .with_context(|| format!("Failed to resolve {}", path))?;
        service
            .observe(&root)
            .with_context(|| format!("Failed to observe {}", root.display()))?;
    }
    Ok(Arc::new(service))
}

/// Flag names joined by `|`, colored by kind of change
pub fn paint_flags(flags: EventFlags) -> String {
    flags
        .to_names()
        .into_iter()
        .map(paint_name)
        .collect::<Vec<_>>()
        .join("|")
}

fn paint_name(name: &str) -> String {
    match name {
        "ItemCreated" => name.green().to_string(),
        "ItemRemoved" => name.red().to_string(),
        "ItemRenamed" => name.magenta().to_string(),
        "ItemModified" | "ItemInodeMetaMod" | "ItemXattrMod" | "ItemChangeOwner"
        | "ItemFinderInfoMod" => name.yellow().to_string(),
        "MustScanSubDirs" | "UserDropped" | "KernelDropped" | "RootChanged" => {
            name.red().bold().to_string()
        }
        "HistoryDone" | "EventIDsWrapped" => name.cyan().to_string(),
        _ => name.dimmed().to_string(),
    }
}
