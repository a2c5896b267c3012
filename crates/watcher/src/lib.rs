//! FSEvents bridge
//!
//! This crate provides:
//! - A handle registry that lets native callbacks find their stream
//! - The callback dispatcher (native arrays in, owned batches out)
//! - The event stream lifecycle (start, stop, flush, resume)
//! - Native backends: CoreServices FSEvents on macOS, and an in-process
//!   emulated service everywhere

pub mod dispatch;
pub mod native;
pub mod registry;
pub mod stream;

pub use dispatch::{Dispatch, RawBatch};
pub use native::{
    EmulatedService, FlushMode, NativeService, NativeStream, Retention, SubscribeRequest,
};
pub use registry::{Handle, Registry};
pub use stream::{EventStream, Status};

#[cfg(target_os = "macos")]
pub use native::FsEventsService;

pub use fsevents_core::{
    Batch, CreateFlags, Error, Event, EventFlags, Result, StreamConfig, EVENT_ID_SINCE_NOW,
    MAX_WATCHED_PATHS,
};
