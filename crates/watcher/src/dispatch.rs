//! Callback dispatcher
//!
//! Runs on the native service's delivery thread. Its only job is to copy
//! the borrowed native records into owned events, find the owning stream
//! through the registry, advance the checkpoint and hand the batch over.
//! It never panics on bad input; malformed records are logged and dropped.

use crate::registry::{Handle, Registry};
use crossbeam_channel::{select, Receiver, Sender};
use fsevents_core::{Batch, Event, EventFlags};
use parking_lot::Mutex;
use std::ffi::{c_char, CStr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::{debug, trace, warn};

static REGISTRY: LazyLock<Registry<Outlet>> = LazyLock::new(Registry::new);

/// Process-wide registry consulted by native callbacks
pub fn registry() -> &'static Registry<Outlet> {
    &REGISTRY
}

/// Borrowed view of one native callback's parallel arrays
///
/// Valid only for the duration of the callback; everything is copied out
/// before [`dispatch`] returns.
pub struct RawBatch<'a> {
    paths: Vec<Option<&'a CStr>>,
    flags: &'a [u32],
    ids: &'a [u64],
}

impl<'a> RawBatch<'a> {
    /// `None` entries in `paths` stand for null native pointers
    pub fn new(paths: Vec<Option<&'a CStr>>, flags: &'a [u32], ids: &'a [u64]) -> Self {
        Self { paths, flags, ids }
    }

    /// View native arrays of `count` entries
    ///
    /// # Safety
    ///
    /// Unless null, `paths`, `flags` and `ids` must each point to `count`
    /// readable elements, and every non-null path must be a NUL-terminated
    /// string, all valid for `'a`.
    pub unsafe fn from_raw_parts(
        count: usize,
        paths: *const *const c_char,
        flags: *const u32,
        ids: *const u64,
    ) -> Self {
        if count == 0 || paths.is_null() || flags.is_null() || ids.is_null() {
            return Self::new(Vec::new(), &[], &[]);
        }

        let raw_paths = std::slice::from_raw_parts(paths, count);
        let paths = raw_paths
            .iter()
            .map(|&ptr| if ptr.is_null() { None } else { Some(CStr::from_ptr(ptr)) })
            .collect();

        Self {
            paths,
            flags: std::slice::from_raw_parts(flags, count),
            ids: std::slice::from_raw_parts(ids, count),
        }
    }

    /// Number of complete records
    pub fn len(&self) -> usize {
        self.paths.len().min(self.flags.len()).min(self.ids.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy into owned events, in native order
    pub fn to_events(&self) -> Batch {
        let len = self.len();
        if len != self.paths.len() || len != self.flags.len() || len != self.ids.len() {
            warn!(
                paths = self.paths.len(),
                flags = self.flags.len(),
                ids = self.ids.len(),
                "Native batch arrays disagree in length; truncating"
            );
        }

        let mut events = Vec::with_capacity(len);
        for i in 0..len {
            let Some(path) = self.paths[i] else {
                warn!(id = self.ids[i], "Dropping native record with a null path");
                continue;
            };
            events.push(Event::new(
                path.to_string_lossy().into_owned(),
                EventFlags::from_raw(self.flags[i]),
                self.ids[i],
            ));
        }
        events
    }
}

/// What happened to a dispatched batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to the consumer
    Delivered(usize),
    /// Nothing left after decoding
    Empty,
    /// Handle no longer registered; the stream is being torn down
    Orphaned,
    /// The stream was stopped while the batch waited for the consumer
    Cancelled,
    /// The output channel is closed
    Closed,
}

/// Delivery side of a started stream, as seen from the callback thread
pub struct Outlet {
    tx: Mutex<Option<Sender<Batch>>>,
    /// Disconnected when the stream starts stopping
    cancel: Receiver<()>,
    checkpoint: Arc<AtomicU64>,
}

impl Outlet {
    pub fn new(tx: Sender<Batch>, cancel: Receiver<()>, checkpoint: Arc<AtomicU64>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            cancel,
            checkpoint,
        }
    }

    /// Current checkpoint
    pub fn checkpoint(&self) -> u64 {
        self.checkpoint.load(Ordering::Acquire)
    }

    /// Close the output channel, returning the sender if it was still open
    pub fn take_sender(&self) -> Option<Sender<Batch>> {
        self.tx.lock().take()
    }

    /// Advance the checkpoint, then block until the consumer takes the batch
    ///
    /// If the batch is not delivered the checkpoint is put back, so an
    /// undelivered change is replayed on resume.
    pub fn deliver(&self, batch: Batch) -> Dispatch {
        if batch.is_empty() {
            return Dispatch::Empty;
        }

        let previous = self.checkpoint.load(Ordering::Acquire);
        let next = advance_checkpoint(previous, &batch);
        self.checkpoint.store(next, Ordering::Release);

        // Clone so the lock is not held while blocked on the consumer.
        let Some(tx) = self.tx.lock().clone() else {
            self.rollback(next, previous);
            return Dispatch::Closed;
        };

        let count = batch.len();
        select! {
            send(tx, batch) -> sent => match sent {
                Ok(()) => Dispatch::Delivered(count),
                Err(_) => {
                    self.rollback(next, previous);
                    Dispatch::Closed
                }
            },
            recv(self.cancel) -> _ => {
                self.rollback(next, previous);
                Dispatch::Cancelled
            }
        }
    }

    fn rollback(&self, next: u64, previous: u64) {
        let _ = self
            .checkpoint
            .compare_exchange(next, previous, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Highest id seen, restarting from the record that announces a wrap
pub fn advance_checkpoint(current: u64, batch: &[Event]) -> u64 {
    batch.iter().fold(current, |checkpoint, event| {
        if event.ids_wrapped() {
            event.id
        } else {
            checkpoint.max(event.id)
        }
    })
}

/// Route one native batch through `registry`
pub fn dispatch(registry: &Registry<Outlet>, handle: Handle, raw: &RawBatch<'_>) -> Dispatch {
    let Some(outlet) = registry.get(handle) else {
        debug!(%handle, records = raw.len(), "Discarding batch for unregistered handle");
        return Dispatch::Orphaned;
    };

    let outcome = outlet.deliver(raw.to_events());
    trace!(%handle, ?outcome, "Dispatched native batch");
    outcome
}

/// Route one native batch through the process-wide registry
pub fn deliver(handle: Handle, raw: &RawBatch<'_>) -> Dispatch {
    dispatch(registry(), handle, raw)
}
