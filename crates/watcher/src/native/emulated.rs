//! In-process event service
//!
//! Keeps a journal of every recorded change under a global, monotonic id
//! and serves subscriptions from it the way FSEvents serves them from its
//! on-disk history:
//! - replay of journal entries newer than `since`, closed by `HistoryDone`
//! - live changes coalesced over the latency window (`NoDefer` or a zero
//!   latency delivers as soon as the inbox drains)
//! - directory-level reporting unless `FileEvents` is set
//! - `RootChanged` for watched roots when `WatchRoot` is set
//! - device scoping and a total path capacity
//!
//! Changes come from [`EmulatedService::record`] or from a `notify`
//! observer attached with [`EmulatedService::observe`].

use super::observer::Observer;
use super::{device_of, FlushMode, NativeService, NativeStream, SubscribeRequest};
use crate::dispatch::{self, RawBatch};
use crate::registry::Handle;
use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use fsevents_core::{CreateFlags, Error, Event, EventFlags, Result, EVENT_ID_SINCE_NOW, MAX_WATCHED_PATHS};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, trace};

/// Bits a directory-level subscription passes through
const STREAM_LEVEL: EventFlags = EventFlags::from_bits_retain(0x0000_00FF);

/// Item changes that can move a watched root
const ROOT_MOVES: EventFlags = EventFlags::ITEM_CREATED
    .union(EventFlags::ITEM_REMOVED)
    .union(EventFlags::ITEM_RENAMED);

/// How much of the journal is kept for replay
#[derive(Debug, Clone)]
pub struct Retention {
    /// Records kept (default: 100_000)
    pub max_records: usize,
    /// Age after which records are dropped (default: 24h)
    pub max_age: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_records: 100_000,
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct Record {
    id: u64,
    path: PathBuf,
    flags: EventFlags,
    device: Option<u64>,
    at: SystemTime,
}

/// State shared by the service, its streams and its observers
pub(super) struct Shared {
    journal: RwLock<VecDeque<Record>>,
    /// Written only under the journal write lock
    last_id: AtomicU64,
    /// Highest id dropped by retention; written under the journal write lock
    trimmed_through: AtomicU64,
    retention: Retention,
    active: DashMap<u64, Arc<Subscription>>,
    admission: Mutex<()>,
    capacity: usize,
    opened: AtomicUsize,
    last_opened: Mutex<Option<Handle>>,
}

impl Shared {
    /// Append to the journal and forward to matching live subscriptions
    pub(super) fn record(&self, path: PathBuf, flags: EventFlags) -> u64 {
        let device = device_near(&path);
        let mut journal = self.journal.write();

        let id = self.last_id.load(Ordering::Acquire) + 1;
        self.last_id.store(id, Ordering::Release);

        let record = Record {
            id,
            path,
            flags,
            device,
            at: SystemTime::now(),
        };
        trace!(id, path = %record.path.display(), %flags, "Recorded change");

        // Forwarding under the write lock keeps live records behind any
        // replay a starting subscription queued under the read lock.
        for subscription in self.active.iter() {
            let events = subscription.project(&record);
            if !events.is_empty() {
                let _ = subscription.control.send(Control::Events(events));
            }
        }

        journal.push_back(record);
        self.trim(&mut journal);
        id
    }

    fn trim(&self, journal: &mut VecDeque<Record>) {
        let cutoff = SystemTime::now().checked_sub(self.retention.max_age);
        while let Some(oldest) = journal.front() {
            let expired = cutoff.is_some_and(|cutoff| oldest.at < cutoff);
            if journal.len() <= self.retention.max_records && !expired {
                break;
            }
            self.trimmed_through.store(oldest.id, Ordering::Release);
            journal.pop_front();
        }
    }
}

/// Device of `path`, or of its closest existing ancestor
fn device_near(path: &Path) -> Option<u64> {
    path.ancestors().find_map(|candidate| device_of(candidate).ok())
}

enum Control {
    Events(Vec<Event>),
    Replay(Vec<Event>),
    Flush(Option<Sender<()>>),
    Halt,
}

struct Subscription {
    handle: Handle,
    paths: Vec<PathBuf>,
    device: Option<u64>,
    flags: CreateFlags,
    control: Sender<Control>,
    latest: AtomicU64,
}

impl Subscription {
    /// What this subscription reports for `record`, if anything
    fn project(&self, record: &Record) -> Vec<Event> {
        if let Some(device) = self.device {
            if record.device != Some(device) {
                return Vec::new();
            }
        }

        let mut events = Vec::new();

        if self.flags.contains(CreateFlags::WATCH_ROOT) && record.flags.intersects(ROOT_MOVES) {
            for root in &self.paths {
                let ancestor = root != &record.path && root.starts_with(&record.path);
                let itself = root == &record.path
                    && record.flags.intersects(EventFlags::ITEM_REMOVED | EventFlags::ITEM_RENAMED);
                if ancestor || itself {
                    events.push(Event::new(
                        root.to_string_lossy(),
                        EventFlags::ROOT_CHANGED,
                        record.id,
                    ));
                }
            }
        }

        if self.paths.iter().any(|root| record.path.starts_with(root)) {
            if self.flags.contains(CreateFlags::FILE_EVENTS) {
                events.push(Event::new(record.path.to_string_lossy(), record.flags, record.id));
            } else {
                let dir = if record.flags.contains(EventFlags::MUST_SCAN_SUB_DIRS) {
                    record.path.as_path()
                } else {
                    record.path.parent().unwrap_or(&record.path)
                };
                events.push(Event::new(
                    dir.to_string_lossy(),
                    record.flags & STREAM_LEVEL,
                    record.id,
                ));
            }
        }

        events
    }
}

/// Merge `incoming` into `pending`, one entry per path. A merged entry
/// moves to the back so ids never decrease along the batch.
fn coalesce(pending: &mut Vec<Event>, incoming: Vec<Event>) {
    for mut event in incoming {
        if let Some(index) = pending.iter().position(|held| held.path == event.path) {
            let held = pending.remove(index);
            event.flags |= held.flags;
            event.id = event.id.max(held.id);
        }
        pending.push(event);
    }
}

/// In-process stand-in for the system event service
pub struct EmulatedService {
    shared: Arc<Shared>,
    observers: Mutex<Vec<Observer>>,
}

impl EmulatedService {
    pub fn new() -> Self {
        Self::with_limits(MAX_WATCHED_PATHS, Retention::default())
    }

    /// Service that admits at most `capacity` watched paths across all
    /// started subscriptions
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_limits(capacity, Retention::default())
    }

    pub fn with_retention(retention: Retention) -> Self {
        Self::with_limits(MAX_WATCHED_PATHS, retention)
    }

    pub fn with_limits(capacity: usize, retention: Retention) -> Self {
        Self {
            shared: Arc::new(Shared {
                journal: RwLock::new(VecDeque::new()),
                last_id: AtomicU64::new(0),
                trimmed_through: AtomicU64::new(0),
                retention,
                active: DashMap::new(),
                admission: Mutex::new(()),
                capacity,
                opened: AtomicUsize::new(0),
                last_opened: Mutex::new(None),
            }),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Record a change and return its id
    pub fn record(&self, path: impl AsRef<Path>, flags: EventFlags) -> u64 {
        self.shared.record(path.as_ref().to_path_buf(), flags)
    }

    /// Feed changes under `root` from the filesystem
    pub fn observe(&self, root: impl AsRef<Path>) -> Result<()> {
        let observer = Observer::spawn(root.as_ref(), Arc::downgrade(&self.shared))?;
        self.observers.lock().push(observer);
        Ok(())
    }

    /// Number of subscriptions opened so far
    pub fn opened_count(&self) -> usize {
        self.shared.opened.load(Ordering::Acquire)
    }

    /// Handle of the most recently opened subscription
    pub fn last_opened(&self) -> Option<Handle> {
        *self.shared.last_opened.lock()
    }

    /// Records currently kept for replay
    pub fn journal_len(&self) -> usize {
        self.shared.journal.read().len()
    }

    /// Paths held by started subscriptions
    pub fn active_paths(&self) -> usize {
        self.shared.active.iter().map(|sub| sub.paths.len()).sum()
    }
}

impl Default for EmulatedService {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeService for EmulatedService {
    fn open(&self, request: SubscribeRequest) -> Result<Arc<dyn NativeStream>> {
        let (control, inbox) = unbounded();
        let (done_tx, done_rx) = bounded(0);

        let subscription = Arc::new(Subscription {
            handle: request.handle,
            paths: request.paths.iter().map(PathBuf::from).collect(),
            device: request.device,
            flags: request.flags,
            control,
            latest: AtomicU64::new(0),
        });
        self.shared.opened.fetch_add(1, Ordering::AcqRel);
        *self.shared.last_opened.lock() = Some(request.handle);
        debug!(handle = %request.handle, paths = request.paths.len(), "Opened emulated subscription");

        Ok(Arc::new(EmulatedStream {
            shared: Arc::clone(&self.shared),
            subscription,
            since: request.since,
            latency: request.latency,
            inbox,
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            halted: AtomicBool::new(false),
        }))
    }

    fn current_event_id(&self) -> u64 {
        self.shared.last_id.load(Ordering::Acquire)
    }

    fn last_event_id_before_time(&self, device: u64, time: SystemTime) -> u64 {
        self.shared
            .journal
            .read()
            .iter()
            .rev()
            .find(|record| record.device == Some(device) && record.at < time)
            .map_or(0, |record| record.id)
    }

    fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

struct EmulatedStream {
    shared: Arc<Shared>,
    subscription: Arc<Subscription>,
    since: u64,
    latency: Duration,
    inbox: Receiver<Control>,
    /// Taken by `run`; dropped when the loop exits
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    halted: AtomicBool,
}

impl EmulatedStream {
    fn deliver(&self, pending: &mut Vec<Event>) {
        if pending.is_empty() {
            return;
        }
        let batch = std::mem::take(pending);

        if let Some(last) = batch.iter().map(|event| event.id).max() {
            self.subscription.latest.fetch_max(last, Ordering::AcqRel);
        }

        let paths: Vec<Option<CString>> = batch
            .iter()
            .map(|event| CString::new(event.path.as_str()).ok())
            .collect();
        let flags: Vec<u32> = batch.iter().map(|event| event.flags.bits()).collect();
        let ids: Vec<u64> = batch.iter().map(|event| event.id).collect();

        let raw = RawBatch::new(paths.iter().map(|p| p.as_deref()).collect(), &flags, &ids);
        dispatch::deliver(self.subscription.handle, &raw);
    }
}

impl NativeStream for EmulatedStream {
    fn run(&self, ready: &dyn Fn()) {
        let Some(done) = self.done_tx.lock().take() else {
            return;
        };
        ready();

        let immediate =
            self.subscription.flags.contains(CreateFlags::NO_DEFER) || self.latency.is_zero();
        let mut pending: Vec<Event> = Vec::new();
        let mut deadline = Instant::now();

        loop {
            let message = if pending.is_empty() {
                self.inbox.recv().map_err(|_| RecvTimeoutError::Disconnected)
            } else {
                self.inbox.recv_deadline(deadline)
            };
            if self.halted.load(Ordering::Acquire) {
                break;
            }

            match message {
                Ok(Control::Events(events)) => {
                    if pending.is_empty() {
                        deadline = Instant::now() + self.latency;
                    }
                    if immediate {
                        pending.extend(events);
                        if self.inbox.is_empty() {
                            self.deliver(&mut pending);
                        }
                    } else {
                        coalesce(&mut pending, events);
                    }
                }
                Ok(Control::Replay(mut events)) => {
                    self.deliver(&mut pending);
                    self.deliver(&mut events);
                }
                Ok(Control::Flush(ack)) => {
                    self.deliver(&mut pending);
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                Err(RecvTimeoutError::Timeout) => self.deliver(&mut pending),
                Ok(Control::Halt) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        debug!(handle = %self.subscription.handle, "Emulated loop exited");
        drop(done);
    }

    fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let _admission = shared.admission.lock();

        let in_use: usize = shared.active.iter().map(|sub| sub.paths.len()).sum();
        let requested = in_use + self.subscription.paths.len();
        if requested > shared.capacity {
            return Err(Error::WatchLimitExceeded {
                requested,
                limit: shared.capacity,
            });
        }

        let journal = shared.journal.read();
        if self.since != EVENT_ID_SINCE_NOW {
            let mut replay = Vec::new();
            // History after `since` was dropped: the subscriber must rescan
            let trimmed = shared.trimmed_through.load(Ordering::Acquire);
            if trimmed > self.since {
                for root in &self.subscription.paths {
                    replay.push(Event::new(
                        root.to_string_lossy(),
                        EventFlags::MUST_SCAN_SUB_DIRS | EventFlags::USER_DROPPED,
                        trimmed,
                    ));
                }
            }
            replay.extend(
                journal
                    .iter()
                    .filter(|record| record.id > self.since)
                    .flat_map(|record| self.subscription.project(record)),
            );
            replay.push(Event::new(
                "",
                EventFlags::HISTORY_DONE,
                shared.last_id.load(Ordering::Acquire),
            ));
            debug!(
                handle = %self.subscription.handle,
                since = self.since,
                events = replay.len() - 1,
                "Replaying journal"
            );
            let _ = self.subscription.control.send(Control::Replay(replay));
        }
        shared
            .active
            .insert(self.subscription.handle.as_raw(), Arc::clone(&self.subscription));
        Ok(())
    }

    fn flush(&self, mode: FlushMode) {
        if self.halted.load(Ordering::Acquire) {
            return;
        }
        match mode {
            FlushMode::Async => {
                let _ = self.subscription.control.send(Control::Flush(None));
            }
            FlushMode::Sync => {
                let (ack_tx, ack_rx) = bounded(1);
                if self.subscription.control.send(Control::Flush(Some(ack_tx))).is_err() {
                    return;
                }
                select! {
                    recv(ack_rx) -> _ => {},
                    recv(self.done_rx) -> _ => {},
                }
            }
        }
    }

    fn halt(&self) {
        if self.halted.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.active.remove(&self.subscription.handle.as_raw());
        let _ = self.subscription.control.send(Control::Halt);
    }

    fn latest_event_id(&self) -> u64 {
        self.subscription.latest.load(Ordering::Acquire)
    }
}
