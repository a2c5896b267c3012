//! Data model for the FSEvents bridge
//!
//! This crate provides:
//! - Event and create flag sets with a stable textual form
//! - The `Event` record handed to consumers
//! - Stream configuration (TOML-loadable)
//! - The error taxonomy shared by the watcher and CLI crates

pub mod config;
pub mod error;
pub mod event;
pub mod flags;

// Re-exports
pub use config::{StreamConfig, MAX_WATCHED_PATHS};
pub use error::{Error, Result};
pub use event::{Batch, Event, EVENT_ID_SINCE_NOW};
pub use flags::{CreateFlags, EventFlags};
