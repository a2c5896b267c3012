//! Shared helpers for the watcher integration tests

#![allow(dead_code)]

use crossbeam_channel::Receiver;
use fsevents_watcher::{Batch, EmulatedService, Event, EventFlags, EventStream, StreamConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Receive batches until `done` holds for everything received so far, or
/// until `timeout` runs out
pub fn collect_until(
    rx: &Receiver<Batch>,
    timeout: Duration,
    mut done: impl FnMut(&[Event]) -> bool,
) -> Vec<Event> {
    let deadline = Instant::now() + timeout;
    let mut events = Vec::new();
    while !done(&events) {
        match rx.recv_deadline(deadline) {
            Ok(batch) => events.extend(batch),
            Err(_) => break,
        }
    }
    events
}

/// Receive until `count` item events (sentinels excluded) have arrived
pub fn collect_items(rx: &Receiver<Batch>, count: usize) -> Vec<Event> {
    collect_until(rx, TIMEOUT, |events| item_events(events).len() >= count)
        .into_iter()
        .filter(|event| !event.is_history_done())
        .collect()
}

pub fn item_events(events: &[Event]) -> Vec<&Event> {
    events.iter().filter(|event| !event.is_history_done()).collect()
}

/// Emulated service plus a stream watching `root`
pub fn emulated_stream(root: &Path, config: impl FnOnce(StreamConfig) -> StreamConfig) -> (Arc<EmulatedService>, EventStream) {
    let service = Arc::new(EmulatedService::new());
    let stream = EventStream::new(
        config(StreamConfig::new([root.to_string_lossy()])),
        service.clone(),
    );
    (service, stream)
}

pub fn path_of(root: &Path, name: &str) -> String {
    root.join(name).to_string_lossy().into_owned()
}

pub const CREATED_FILE: EventFlags = EventFlags::ITEM_CREATED.union(EventFlags::ITEM_IS_FILE);
