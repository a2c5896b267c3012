//! CLI command implementations

pub mod before;
pub mod device;
pub mod history;
pub mod latest;
pub mod watch;
