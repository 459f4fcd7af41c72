//! Per-session tuning knobs.

use super::sequencer::BootstrapConfig;
use crate::history::DEFAULT_HISTORY_CAPACITY;
use std::time::Duration;

/// Bytes requested per PTY read.
pub const DEFAULT_READ_CHUNK: usize = 1024;

/// Capacity of the reader → dispatch channel.
pub const DEFAULT_DISPATCH_QUEUE: usize = 256;

/// Session configuration. `Default` gives the stock timings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Events retained for replay.
    pub history_capacity: usize,
    /// Maximum bytes per read.
    pub read_chunk: usize,
    /// How long a single read waits before re-checking the stop flag.
    pub read_timeout: Duration,
    /// Bounded queue between the reader thread and the dispatch point.
    pub dispatch_queue: usize,
    /// Wait after the graceful interrupt before force-terminating.
    pub grace_period: Duration,
    /// Bound on waiting for the reader thread and for reaping the child.
    pub join_timeout: Duration,
    /// Sent (followed by CR) after the interrupt during a graceful stop.
    pub quit_command: Option<String>,
    /// Optional one-shot bootstrap sent once the child looks ready.
    pub bootstrap: Option<BootstrapConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            read_chunk: DEFAULT_READ_CHUNK,
            read_timeout: Duration::from_millis(50),
            dispatch_queue: DEFAULT_DISPATCH_QUEUE,
            grace_period: Duration::from_millis(500),
            join_timeout: Duration::from_secs(2),
            quit_command: Some("exit".to_string()),
            bootstrap: None,
        }
    }
}

impl SessionConfig {
    pub fn with_bootstrap(mut self, bootstrap: BootstrapConfig) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }
}
