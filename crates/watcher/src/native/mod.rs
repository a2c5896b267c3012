//! Native event service seam
//!
//! An [`EventStream`](crate::EventStream) talks to the operating system
//! through two traits:
//! - [`NativeService`] opens subscriptions and answers event id queries
//! - [`NativeStream`] is one subscription, driven by a dedicated loop thread
//!
//! Backends:
//! - `fsevents` (macOS): CoreServices FSEvents
//! - `emulated`: in-process journal, optionally fed by `notify`

pub mod emulated;
mod observer;

#[cfg(target_os = "macos")]
pub mod fsevents;

pub use emulated::{EmulatedService, Retention};

#[cfg(target_os = "macos")]
pub use fsevents::FsEventsService;

use crate::registry::Handle;
use fsevents_core::{CreateFlags, Error, Result, MAX_WATCHED_PATHS};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Everything a backend needs to open one subscription
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    /// Carried through the native context; callbacks dispatch with it
    pub handle: Handle,
    /// Absolute, deduplicated paths
    pub paths: Vec<String>,
    /// First id of interest, or [`EVENT_ID_SINCE_NOW`](fsevents_core::EVENT_ID_SINCE_NOW)
    pub since: u64,
    pub latency: Duration,
    pub device: Option<u64>,
    pub flags: CreateFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Block until held events have been delivered
    Sync,
    /// Request delivery and return
    Async,
}

/// Process-wide view of the native event service
pub trait NativeService: Send + Sync + 'static {
    /// Create a subscription. It does not report anything until it has been
    /// scheduled by [`NativeStream::run`] and started.
    fn open(&self, request: SubscribeRequest) -> Result<Arc<dyn NativeStream>>;

    /// Most recent id issued system-wide
    fn current_event_id(&self) -> u64;

    /// Last id issued on `device` before `time`
    fn last_event_id_before_time(&self, device: u64, time: SystemTime) -> u64;

    /// Device number of the filesystem holding `path`
    fn device_for_path(&self, path: &Path) -> Result<u64> {
        device_of(path)
    }

    /// Identifier of the event history kept for `device`, if the backend has one
    fn device_uuid(&self, _device: u64) -> Option<String> {
        None
    }

    /// Most paths a single subscription may watch
    fn capacity(&self) -> usize {
        MAX_WATCHED_PATHS
    }
}

/// One open subscription
pub trait NativeStream: Send + Sync {
    /// Schedule the subscription on the calling thread, call `ready`, then
    /// service callbacks until [`halt`](Self::halt). Callbacks run on this
    /// thread and nowhere else.
    fn run(&self, ready: &dyn Fn());

    /// Begin reporting. Called once, after `run` has signalled ready.
    fn start(&self) -> Result<()>;

    fn flush(&self, mode: FlushMode);

    /// Stop reporting and make `run` return. Idempotent.
    fn halt(&self);

    /// Last id this subscription has seen
    fn latest_event_id(&self) -> u64;
}

#[cfg(unix)]
pub(crate) fn device_of(path: &Path) -> Result<u64> {
    use std::os::unix::fs::MetadataExt;

    std::fs::symlink_metadata(path)
        .map(|meta| meta.dev())
        .map_err(|source| Error::DeviceLookup {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
pub(crate) fn device_of(path: &Path) -> Result<u64> {
    Err(Error::DeviceLookup {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::Unsupported, "device numbers are unix-only"),
    })
}
