pub mod cli;
pub mod daemon;

use std::time::Duration;

/// Runtime settings for [`crate::PartitionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Pause between refresh cycles.
    pub refresh_interval: Duration,
    /// Mutations that may wait in the queue before submissions are refused.
    pub queue_capacity: usize,
    /// Start the refresh loop as part of `init`.
    pub start_monitoring: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_millis(1000),
            queue_capacity: 64,
            start_monitoring: true,
        }
    }
}

impl From<&daemon::DaemonArgs> for ManagerConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            refresh_interval: Duration::from_millis(args.refresh_interval_ms),
            queue_capacity: args.queue_capacity.max(1),
            start_monitoring: args.monitoring,
        }
    }
}

pub use cli::*;
pub use daemon::*;
