//! Event records delivered to consumers

use crate::flags::EventFlags;
use std::fmt;

/// Native "start from now" sentinel for the `since` argument
pub const EVENT_ID_SINCE_NOW: u64 = u64::MAX;

/// One reported change
///
/// `id` is the native sequence number. It is monotonically non-decreasing
/// within a device until the 64-bit space wraps, which the native service
/// announces with [`EventFlags::EVENT_IDS_WRAPPED`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    /// Absolute path of the changed item
    pub path: String,
    pub flags: EventFlags,
    pub id: u64,
}

impl Event {
    pub fn new(path: impl Into<String>, flags: EventFlags, id: u64) -> Self {
        Self {
            path: path.into(),
            flags,
            id,
        }
    }

    /// Sentinel that ends a history replay
    pub fn is_history_done(&self) -> bool {
        self.flags.has(EventFlags::HISTORY_DONE)
    }

    pub fn ids_wrapped(&self) -> bool {
        self.flags.has(EventFlags::EVENT_IDS_WRAPPED)
    }

    pub fn must_rescan(&self) -> bool {
        self.flags.must_rescan()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>12} {} {}", self.id, self.flags, self.path)
    }
}

/// A batch as delivered by one native callback, in native order
pub type Batch = Vec<Event>;
