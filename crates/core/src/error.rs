//! Error taxonomy shared by every crate in the workspace

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no valid paths to watch")]
    NoPaths,

    /// The native service refused the subscription because too many paths
    /// are watched. Recoverable by splitting the paths across streams.
    #[error("watch limit exceeded: {requested} paths requested, limit is {limit}")]
    WatchLimitExceeded { requested: usize, limit: usize },

    #[error("failed to resolve path {path:?}: {source}")]
    PathResolution {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("device lookup failed for {}: {source}", path.display())]
    DeviceLookup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("native subscription failed: {0}")]
    Subscription(String),

    #[error("event stream is already started")]
    AlreadyStarted,

    #[error("event stream must be stopped before it can be resumed")]
    NotStopped,

    #[error("unknown flag name: {0:?}")]
    UnknownFlag(String),

    #[error("invalid stream configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors the caller can fix by watching fewer paths
    pub fn is_watch_limit(&self) -> bool {
        matches!(self, Error::WatchLimitExceeded { .. })
    }
}
