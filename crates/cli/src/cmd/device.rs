//! Show which device a path lives on

use crate::util;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run(path: &Path) -> Result<()> {
    let service = util::system_service();

    let device = service
        .device_for_path(path)
        .with_context(|| format!("Failed to look up device for {}", path.display()))?;

    println!("Path:    {}", path.display().to_string().cyan());
    println!("Device:  {}", device);
    match service.device_uuid(device) {
        Some(uuid) => println!("History: {}", uuid),
        None => println!("History: {}", "none".dimmed()),
    }
    Ok(())
}
