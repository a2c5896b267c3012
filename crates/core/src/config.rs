//! Stream configuration
//!
//! A [`StreamConfig`] is what the application fills in before starting a
//! stream. It can be built in code or loaded from TOML:
//!
//! ```toml
//! paths = ["/tmp/project"]
//! latency_ms = 500
//! flags = ["FileEvents", "NoDefer"]
//! resume = true
//! event_id = 12345
//! ```

use crate::error::{Error, Result};
use crate::flags::CreateFlags;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Largest path set a single native subscription accepts
pub const MAX_WATCHED_PATHS: usize = 4096;

/// Watch request for one event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    /// Paths to watch, in the order given
    pub paths: Vec<String>,

    /// Coalescing window
    #[serde(rename = "latency_ms", with = "millis")]
    pub latency: Duration,

    /// Restrict the stream to one device (`None` or `0` = no scoping)
    pub device: Option<u64>,

    pub flags: CreateFlags,

    /// Replay from `event_id` instead of starting from now
    pub resume: bool,

    /// Checkpoint: last delivered id, or where to resume from
    pub event_id: u64,

    /// Output channel capacity; 0 hands each batch over synchronously
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            latency: Duration::ZERO,
            device: None,
            flags: CreateFlags::empty(),
            resume: false,
            event_id: 0,
            channel_capacity: 0,
        }
    }
}

impl StreamConfig {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_flags(mut self, flags: CreateFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_device(mut self, device: u64) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Resume delivery after `event_id`
    pub fn resuming_from(mut self, event_id: u64) -> Self {
        self.resume = true;
        self.event_id = event_id;
        self
    }

    /// Device scope, treating `0` as unscoped
    pub fn device(&self) -> Option<u64> {
        self.device.filter(|&dev| dev != 0)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
