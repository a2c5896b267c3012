//! CoreServices FSEvents backend
//!
//! One `FSEventStreamRef` per subscription. The stream context carries the
//! registry handle as its `info` pointer, so the callback never touches a
//! Rust object directly; it looks the handle up and dispatches.

use super::{FlushMode, NativeService, NativeStream, SubscribeRequest};
use crate::dispatch::{self, RawBatch};
use crate::registry::Handle;
use core_foundation_sys::array::{kCFTypeArrayCallBacks, CFArrayCreate, CFArrayRef};
use core_foundation_sys::base::{kCFAllocatorDefault, CFAllocatorRef, CFIndex, CFRelease};
use core_foundation_sys::date::CFAbsoluteTime;
use core_foundation_sys::runloop::{
    kCFRunLoopDefaultMode, kCFRunLoopRunFinished, CFRunLoopGetCurrent, CFRunLoopRef,
    CFRunLoopRunInMode, CFRunLoopStop,
};
use core_foundation_sys::string::{
    kCFStringEncodingUTF8, CFStringCreateWithBytes, CFStringGetCString, CFStringRef,
};
use core_foundation_sys::uuid::{CFUUIDCreateString, CFUUIDRef};
use fsevents_core::{CreateFlags, Error, Result, MAX_WATCHED_PATHS};
use parking_lot::Mutex;
use std::ffi::{c_char, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

type FSEventStreamRef = *mut c_void;
type FSEventStreamEventId = u64;
type DevT = i32;

/// Seconds between the Unix epoch and the CoreFoundation epoch (2001-01-01)
const CF_EPOCH_OFFSET: f64 = 978_307_200.0;

/// How long one run loop slice lasts before the halt flag is rechecked
const RUN_SLICE: f64 = 0.25;

#[repr(C)]
struct FSEventStreamContext {
    version: CFIndex,
    info: *mut c_void,
    retain: Option<extern "C" fn(*const c_void) -> *const c_void>,
    release: Option<extern "C" fn(*const c_void)>,
    copy_description: Option<extern "C" fn(*const c_void) -> CFStringRef>,
}

type FSEventStreamCallback = extern "C" fn(
    stream_ref: FSEventStreamRef,
    client_callback_info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const u32,
    event_ids: *const FSEventStreamEventId,
);

#[link(name = "CoreServices", kind = "framework")]
extern "C" {
    fn FSEventStreamCreate(
        allocator: CFAllocatorRef,
        callback: FSEventStreamCallback,
        context: *mut FSEventStreamContext,
        paths_to_watch: CFArrayRef,
        since_when: FSEventStreamEventId,
        latency: f64,
        flags: u32,
    ) -> FSEventStreamRef;

    fn FSEventStreamCreateRelativeToDevice(
        allocator: CFAllocatorRef,
        callback: FSEventStreamCallback,
        context: *mut FSEventStreamContext,
        device_to_watch: DevT,
        paths_to_watch_relative_to_device: CFArrayRef,
        since_when: FSEventStreamEventId,
        latency: f64,
        flags: u32,
    ) -> FSEventStreamRef;

    fn FSEventStreamScheduleWithRunLoop(
        stream: FSEventStreamRef,
        run_loop: CFRunLoopRef,
        run_loop_mode: CFStringRef,
    );

    fn FSEventStreamStart(stream: FSEventStreamRef) -> bool;
    fn FSEventStreamFlushSync(stream: FSEventStreamRef);
    fn FSEventStreamFlushAsync(stream: FSEventStreamRef) -> FSEventStreamEventId;
    fn FSEventStreamStop(stream: FSEventStreamRef);
    fn FSEventStreamInvalidate(stream: FSEventStreamRef);
    fn FSEventStreamRelease(stream: FSEventStreamRef);
    fn FSEventStreamGetLatestEventId(stream: FSEventStreamRef) -> FSEventStreamEventId;

    fn FSEventsGetCurrentEventId() -> FSEventStreamEventId;
    fn FSEventsGetLastEventIdForDeviceBeforeTime(
        dev: DevT,
        time: CFAbsoluteTime,
    ) -> FSEventStreamEventId;
    fn FSEventsCopyUUIDForDevice(dev: DevT) -> CFUUIDRef;
}

/// `CFRunLoopRef` that may be stopped from another thread
///
/// Safety: `CFRunLoopStop` is documented as callable from any thread.
#[derive(Clone, Copy)]
struct SendableRunLoop(CFRunLoopRef);
unsafe impl Send for SendableRunLoop {}
unsafe impl Sync for SendableRunLoop {}

/// System FSEvents service
#[derive(Debug, Default, Clone, Copy)]
pub struct FsEventsService;

impl FsEventsService {
    pub fn new() -> Self {
        Self
    }
}

impl NativeService for FsEventsService {
    fn open(&self, request: SubscribeRequest) -> Result<Arc<dyn NativeStream>> {
        let stream = FsEventsStream::create(&request)?;
        debug!(handle = %request.handle, paths = request.paths.len(), "Created FSEvents stream");
        Ok(Arc::new(stream))
    }

    fn current_event_id(&self) -> u64 {
        unsafe { FSEventsGetCurrentEventId() }
    }

    fn last_event_id_before_time(&self, device: u64, time: SystemTime) -> u64 {
        let unix = match time.duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_secs_f64(),
            Err(before) => -before.duration().as_secs_f64(),
        };
        unsafe { FSEventsGetLastEventIdForDeviceBeforeTime(device as DevT, unix - CF_EPOCH_OFFSET) }
    }

    fn device_uuid(&self, device: u64) -> Option<String> {
        unsafe {
            let uuid = FSEventsCopyUUIDForDevice(device as DevT);
            if uuid.is_null() {
                return None;
            }
            let text = CFUUIDCreateString(kCFAllocatorDefault, uuid);
            CFRelease(uuid as *const c_void);
            if text.is_null() {
                return None;
            }
            let converted = cfstring_to_string(text);
            CFRelease(text as *const c_void);
            converted
        }
    }
}

struct FsEventsStream {
    stream: FSEventStreamRef,
    handle: Handle,
    path_count: usize,
    run_loop: Mutex<Option<SendableRunLoop>>,
    /// Held across a flush and by `halt`, so no flush overlaps the stop
    /// and invalidation that follow a halt
    control: Mutex<()>,
    scheduled: AtomicBool,
    invalidated: AtomicBool,
    started: AtomicBool,
    halted: AtomicBool,
}

// Safety: the stream functions used here may be called from any thread;
// scheduling and invalidation happen on the loop thread only.
unsafe impl Send for FsEventsStream {}
unsafe impl Sync for FsEventsStream {}

impl FsEventsStream {
    fn create(request: &SubscribeRequest) -> Result<Self> {
        // Paths are always decoded as C strings.
        let flags = request.flags.difference(CreateFlags::USE_CF_TYPES).bits();
        let latency = request.latency.as_secs_f64();

        let mut context = FSEventStreamContext {
            version: 0,
            info: request.handle.as_raw() as usize as *mut c_void,
            retain: None,
            release: None,
            copy_description: None,
        };

        // Safety: every CF object created here is released before returning;
        // the stream keeps its own copy of the path array.
        let stream = unsafe {
            let strings: Vec<CFStringRef> =
                request.paths.iter().map(|path| str_to_cfstring(path)).collect();
            let array = CFArrayCreate(
                kCFAllocatorDefault,
                strings.as_ptr() as *const *const c_void,
                strings.len() as CFIndex,
                &kCFTypeArrayCallBacks,
            );
            for string in &strings {
                CFRelease(*string as *const c_void);
            }

            let stream = match request.device {
                Some(device) => FSEventStreamCreateRelativeToDevice(
                    kCFAllocatorDefault,
                    stream_callback,
                    &mut context,
                    device as DevT,
                    array,
                    request.since,
                    latency,
                    flags,
                ),
                None => FSEventStreamCreate(
                    kCFAllocatorDefault,
                    stream_callback,
                    &mut context,
                    array,
                    request.since,
                    latency,
                    flags,
                ),
            };
            CFRelease(array as *const c_void);
            stream
        };

        if stream.is_null() {
            return Err(Error::Subscription(format!(
                "FSEventStreamCreate returned null for {} paths",
                request.paths.len()
            )));
        }

        Ok(Self {
            stream,
            handle: request.handle,
            path_count: request.paths.len(),
            run_loop: Mutex::new(None),
            control: Mutex::new(()),
            scheduled: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
            started: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        })
    }
}

impl NativeStream for FsEventsStream {
    fn run(&self, ready: &dyn Fn()) {
        unsafe {
            let run_loop = CFRunLoopGetCurrent();
            FSEventStreamScheduleWithRunLoop(self.stream, run_loop, kCFRunLoopDefaultMode);
            self.scheduled.store(true, Ordering::Release);
            *self.run_loop.lock() = Some(SendableRunLoop(run_loop));
        }
        ready();

        while !self.halted.load(Ordering::Acquire) {
            let result = unsafe { CFRunLoopRunInMode(kCFRunLoopDefaultMode, RUN_SLICE, 0) };
            if result == kCFRunLoopRunFinished {
                // No sources attached yet; avoid spinning.
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        *self.run_loop.lock() = None;
        unsafe { FSEventStreamInvalidate(self.stream) };
        self.invalidated.store(true, Ordering::Release);
        debug!(handle = %self.handle, "FSEvents run loop exited");
    }

    fn start(&self) -> Result<()> {
        if unsafe { FSEventStreamStart(self.stream) } {
            self.started.store(true, Ordering::Release);
            return Ok(());
        }
        if self.path_count >= MAX_WATCHED_PATHS {
            Err(Error::WatchLimitExceeded {
                requested: self.path_count,
                limit: MAX_WATCHED_PATHS,
            })
        } else {
            Err(Error::Subscription("FSEventStreamStart failed".to_string()))
        }
    }

    fn flush(&self, mode: FlushMode) {
        let _control = self.control.lock();
        if !self.started.load(Ordering::Acquire) || self.halted.load(Ordering::Acquire) {
            return;
        }
        unsafe {
            match mode {
                FlushMode::Sync => FSEventStreamFlushSync(self.stream),
                FlushMode::Async => {
                    FSEventStreamFlushAsync(self.stream);
                }
            }
        }
    }

    fn halt(&self) {
        // A sync flush in progress returns once `stop` has cancelled the
        // delivery it may be blocked on.
        let _control = self.control.lock();
        if self.halted.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.started.load(Ordering::Acquire) {
            unsafe { FSEventStreamStop(self.stream) };
        }
        if let Some(run_loop) = *self.run_loop.lock() {
            unsafe { CFRunLoopStop(run_loop.0) };
        }
    }

    fn latest_event_id(&self) -> u64 {
        unsafe { FSEventStreamGetLatestEventId(self.stream) }
    }
}

impl Drop for FsEventsStream {
    fn drop(&mut self) {
        unsafe {
            if self.scheduled.load(Ordering::Acquire) && !self.invalidated.load(Ordering::Acquire) {
                FSEventStreamInvalidate(self.stream);
            }
            FSEventStreamRelease(self.stream);
        }
    }
}

extern "C" fn stream_callback(
    _stream_ref: FSEventStreamRef,
    client_callback_info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const u32,
    event_ids: *const FSEventStreamEventId,
) {
    let handle = Handle::from_raw(client_callback_info as usize as u64);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // Safety: FSEvents passes `num_events` C strings, flags and ids,
        // valid for the duration of this callback.
        let raw = unsafe {
            RawBatch::from_raw_parts(
                num_events,
                event_paths as *const *const c_char,
                event_flags,
                event_ids,
            )
        };
        dispatch::deliver(handle, &raw)
    }));

    if outcome.is_err() {
        error!(%handle, "Panic while dispatching FSEvents batch; batch dropped");
    }
}

unsafe fn str_to_cfstring(s: &str) -> CFStringRef {
    CFStringCreateWithBytes(
        kCFAllocatorDefault,
        s.as_ptr(),
        s.len() as CFIndex,
        kCFStringEncodingUTF8,
        false as u8,
    )
}

unsafe fn cfstring_to_string(s: CFStringRef) -> Option<String> {
    let mut buffer = [0 as c_char; 64];
    if CFStringGetCString(s, buffer.as_mut_ptr(), buffer.len() as CFIndex, kCFStringEncodingUTF8) == 0 {
        return None;
    }
    Some(CStr::from_ptr(buffer.as_ptr()).to_string_lossy().into_owned())
}
