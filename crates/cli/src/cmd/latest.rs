//! Print the current system-wide event id

use crate::util;
use anyhow::Result;

pub async fn run() -> Result<()> {
    let service = util::system_service();
    println!("{}", service.current_event_id());
    Ok(())
}
