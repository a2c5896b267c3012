//! Find the last event id on a device before a point in time

use crate::util;
use anyhow::Result;
use std::time::{Duration, UNIX_EPOCH};

pub async fn run(device: u64, unix_seconds: u64) -> Result<()> {
    let service = util::system_service();
    let time = UNIX_EPOCH + Duration::from_secs(unix_seconds);
    println!("{}", service.last_event_id_before_time(device, time));
    Ok(())
}
