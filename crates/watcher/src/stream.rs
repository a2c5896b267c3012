//! Event stream lifecycle
//!
//! An [`EventStream`] owns one native subscription at a time:
//! - `Idle → Started` on [`EventStream::start`]
//! - `Started → Stopped` on [`EventStream::stop`]
//! - `Stopped → Started` on [`EventStream::resume`], replaying from the checkpoint
//!
//! Each started session gets its own output channel. `stop` closes it, so a
//! consumer blocked in `recv` wakes up with a disconnect; after a resume the
//! consumer picks up the new receiver from [`EventStream::events`].

use crate::dispatch::{registry, Outlet};
use crate::native::{FlushMode, NativeService, NativeStream, SubscribeRequest};
use crate::registry::Handle;
use crossbeam_channel::{bounded, Receiver, Sender};
use fsevents_core::{Batch, Error, Event, Result, StreamConfig, EVENT_ID_SINCE_NOW, MAX_WATCHED_PATHS};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Started,
    Stopped,
}

/// Resources of one started session, torn down together by `stop`
struct Session {
    handle: Handle,
    native: Arc<dyn NativeStream>,
    outlet: Arc<Outlet>,
    /// Dropped first on stop to unblock a pending delivery
    cancel: Sender<()>,
    thread: JoinHandle<()>,
}

enum State {
    Idle,
    Started(Session),
    Stopped,
}

struct Inner {
    config: StreamConfig,
    state: State,
    /// Sender for the receiver currently exposed by `events()`, until a
    /// session takes it
    pending_tx: Option<Sender<Batch>>,
    path_errors: Vec<Error>,
    /// Resolved paths of the last start
    paths: Vec<String>,
    /// The checkpoint holds a real event id, so a resume replays from it
    /// even when that id is 0
    seeded: bool,
}

/// A watch over a set of paths, fed by a native service
///
/// Call [`EventStream::stop`] when done. Dropping a started stream stops it
/// as a last-resort leak guard, but a stream that is leaked or still alive
/// at process exit is never stopped.
pub struct EventStream {
    service: Arc<dyn NativeService>,
    inner: Mutex<Inner>,
    checkpoint: Arc<AtomicU64>,
    events: Mutex<Receiver<Batch>>,
}

impl EventStream {
    pub fn new(config: StreamConfig, service: Arc<dyn NativeService>) -> Self {
        let (tx, rx) = bounded(config.channel_capacity);
        let checkpoint = Arc::new(AtomicU64::new(config.event_id));
        let seeded = config.event_id != 0;
        Self {
            service,
            inner: Mutex::new(Inner {
                config,
                state: State::Idle,
                pending_tx: Some(tx),
                path_errors: Vec::new(),
                paths: Vec::new(),
                seeded,
            }),
            checkpoint,
            events: Mutex::new(rx),
        }
    }

    /// Stream backed by the system FSEvents service
    #[cfg(target_os = "macos")]
    pub fn native(config: StreamConfig) -> Self {
        Self::new(config, Arc::new(crate::native::FsEventsService::new()))
    }

    /// Begin delivering events
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.start_locked(&mut inner)
    }

    fn start_locked(&self, inner: &mut Inner) -> Result<()> {
        if matches!(inner.state, State::Started(_)) {
            return Err(Error::AlreadyStarted);
        }

        let (paths, errors) = resolve_paths(&inner.config.paths);
        for error in &errors {
            warn!("Skipping path: {}", error);
        }
        inner.path_errors.extend(errors);

        if paths.is_empty() {
            return Err(Error::NoPaths);
        }
        let limit = MAX_WATCHED_PATHS.min(self.service.capacity());
        if paths.len() > limit {
            return Err(Error::WatchLimitExceeded {
                requested: paths.len(),
                limit,
            });
        }

        let previous = self.checkpoint.load(Ordering::Acquire);
        let replaying = inner.config.resume && inner.seeded;
        let since = if replaying {
            previous
        } else {
            self.checkpoint
                .store(self.service.current_event_id(), Ordering::Release);
            EVENT_ID_SINCE_NOW
        };

        let tx = match inner.pending_tx.take() {
            Some(tx) => tx,
            None => {
                let (tx, rx) = bounded(inner.config.channel_capacity);
                *self.events.lock() = rx;
                tx
            }
        };
        let (cancel_tx, cancel_rx) = bounded(0);
        let outlet = Arc::new(Outlet::new(tx, cancel_rx, Arc::clone(&self.checkpoint)));
        let handle = registry().add(Arc::clone(&outlet));

        let request = SubscribeRequest {
            handle,
            paths: paths.clone(),
            since,
            latency: inner.config.latency,
            device: inner.config.device(),
            flags: inner.config.flags,
        };

        match self.launch(request) {
            Ok((native, thread)) => {
                info!(
                    %handle,
                    paths = paths.len(),
                    since,
                    "Event stream started"
                );
                inner.paths = paths;
                inner.seeded = true;
                inner.state = State::Started(Session {
                    handle,
                    native,
                    outlet,
                    cancel: cancel_tx,
                    thread,
                });
                Ok(())
            }
            Err(error) => {
                registry().delete(handle);
                inner.pending_tx = outlet.take_sender();
                if !replaying {
                    self.checkpoint.store(previous, Ordering::Release);
                }
                debug!(%handle, "Start failed: {}", error);
                Err(error)
            }
        }
    }

    /// Open the subscription, run its loop thread and start it. Undoes its
    /// own steps on failure; the caller undoes registration.
    fn launch(&self, request: SubscribeRequest) -> Result<(Arc<dyn NativeStream>, JoinHandle<()>)> {
        let handle = request.handle;
        let native = self.service.open(request)?;

        let (ready_tx, ready_rx) = bounded(1);
        let thread = thread::Builder::new()
            .name(format!("fsevents-loop-{}", handle))
            .spawn({
                let native = Arc::clone(&native);
                move || {
                    native.run(&|| {
                        let _ = ready_tx.send(());
                    })
                }
            })?;

        let started = if ready_rx.recv().is_ok() {
            native.start()
        } else {
            Err(Error::Subscription(format!(
                "loop thread for handle {} exited before scheduling",
                handle
            )))
        };

        if let Err(error) = started {
            native.halt();
            if thread.join().is_err() {
                warn!(%handle, "Loop thread panicked");
            }
            return Err(error);
        }
        Ok((native, thread))
    }

    /// Stop delivering events. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        let session = match mem::replace(&mut inner.state, State::Stopped) {
            State::Started(session) => session,
            other => {
                inner.state = other;
                return;
            }
        };

        let handle = session.handle;
        drop(session.cancel);
        session.native.halt();
        if session.thread.join().is_err() {
            warn!(%handle, "Loop thread panicked");
        }
        registry().delete(handle);
        drop(session.outlet.take_sender());

        info!(%handle, checkpoint = self.event_id(), "Event stream stopped");
    }

    /// Ask the native service to deliver held events. `sync` waits until
    /// they have been handed to the consumer.
    pub fn flush(&self, sync: bool) {
        let native = match &self.inner.lock().state {
            State::Started(session) => Arc::clone(&session.native),
            _ => return,
        };
        native.flush(if sync { FlushMode::Sync } else { FlushMode::Async });
    }

    /// Start again from the checkpoint after a stop
    pub fn resume(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, State::Stopped) {
            return Err(Error::NotStopped);
        }
        inner.config.resume = true;
        self.start_locked(&mut inner)
    }

    /// Stop, then resume from the checkpoint
    pub fn restart(&self) -> Result<()> {
        self.stop();
        let mut inner = self.inner.lock();
        inner.config.resume = true;
        self.start_locked(&mut inner)
    }

    /// Receiver of the current session's batches
    pub fn events(&self) -> Receiver<Batch> {
        self.events.lock().clone()
    }

    /// Checkpoint: the last id handed to the consumer
    pub fn event_id(&self) -> u64 {
        self.checkpoint.load(Ordering::Acquire)
    }

    /// Seed the checkpoint a later resume starts from. `0` means the
    /// resume starts from now.
    pub fn set_event_id(&self, id: u64) {
        let mut inner = self.inner.lock();
        self.checkpoint.store(id, Ordering::Release);
        inner.seeded = id != 0;
    }

    /// Last id seen by the running subscription, or the checkpoint
    pub fn latest_event_id(&self) -> u64 {
        match &self.inner.lock().state {
            State::Started(session) => session.native.latest_event_id(),
            _ => self.event_id(),
        }
    }

    pub fn status(&self) -> Status {
        match self.inner.lock().state {
            State::Idle => Status::Idle,
            State::Started(_) => Status::Started,
            State::Stopped => Status::Stopped,
        }
    }

    /// Registry handle of the running session
    pub fn handle(&self) -> Option<Handle> {
        match &self.inner.lock().state {
            State::Started(session) => Some(session.handle),
            _ => None,
        }
    }

    pub fn config(&self) -> StreamConfig {
        self.inner.lock().config.clone()
    }

    /// Paths actually watched by the last start
    pub fn paths(&self) -> Vec<String> {
        self.inner.lock().paths.clone()
    }

    /// Drain the paths skipped by previous starts
    pub fn take_path_errors(&self) -> Vec<Error> {
        mem::take(&mut self.inner.lock().path_errors)
    }

    /// Every event recorded for `paths` after `since`, ending with the
    /// `HistoryDone` sentinel. `since == 0` asks from now, which yields only
    /// what the service was still holding.
    pub fn history_since(
        service: Arc<dyn NativeService>,
        paths: Vec<String>,
        device: Option<u64>,
        since: u64,
    ) -> Result<Vec<Event>> {
        let mut config = StreamConfig::new(paths).resuming_from(since);
        config.device = device;
        let stream = Self::new(config, service);

        let rx = stream.events();
        stream.start()?;
        let collector = thread::Builder::new()
            .name("fsevents-history".to_string())
            .spawn(move || rx.iter().flatten().collect::<Vec<Event>>())?;

        stream.flush(true);
        stream.stop();

        let events = collector
            .join()
            .map_err(|_| Error::Subscription("history collector panicked".to_string()))?;
        debug!(since, events = events.len(), "Collected history");
        Ok(events)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if matches!(self.inner.get_mut().state, State::Started(_)) {
            warn!("Event stream dropped while started; stopping it");
            self.stop();
        }
    }
}

/// Absolute, deduplicated paths in first-seen order, plus the failures
fn resolve_paths(raw: &[String]) -> (Vec<String>, Vec<Error>) {
    let mut seen = HashSet::new();
    let mut paths = Vec::new();
    let mut errors = Vec::new();

    for path in raw {
        match resolve_path(path) {
            Ok(resolved) => {
                if seen.insert(resolved.clone()) {
                    paths.push(resolved);
                }
            }
            Err(error) => errors.push(error),
        }
    }
    (paths, errors)
}

fn resolve_path(path: &str) -> Result<String> {
    let failed = |source: io::Error| Error::PathResolution {
        path: path.to_string(),
        source,
    };

    if path.contains('\0') {
        return Err(failed(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path contains a NUL byte",
        )));
    }
    let absolute = std::path::absolute(path).map_err(failed)?;
    absolute.into_os_string().into_string().map_err(|_| {
        failed(io::Error::new(
            io::ErrorKind::InvalidData,
            "path is not valid UTF-8",
        ))
    })
}
