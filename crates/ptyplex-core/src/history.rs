//! Bounded event history for replay on subscribe.
//!
//! Keeps the most recent N events so that a late or reconnecting client
//! can receive a snapshot without the session keeping unbounded output.

use crate::event::OutputEvent;
use std::collections::VecDeque;

/// Default number of events retained per session.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// A fixed-capacity FIFO of output events.
#[derive(Debug)]
pub struct HistoryBuffer {
    events: VecDeque<OutputEvent>,
    capacity: usize,
    /// Total events ever pushed (used to report evictions).
    total_pushed: u64,
}

impl HistoryBuffer {
    /// Create a new buffer holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity,
            total_pushed: 0,
        }
    }

    /// Append an event, evicting the oldest one when full.
    pub fn push(&mut self, event: OutputEvent) {
        self.total_pushed += 1;
        if self.capacity == 0 {
            return;
        }
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
    }

    /// Clone all buffered events in production order.
    pub fn snapshot(&self) -> Vec<OutputEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total events ever pushed through this buffer.
    pub fn total_pushed(&self) -> u64 {
        self.total_pushed
    }

    /// Number of events dropped by eviction.
    pub fn evicted(&self) -> u64 {
        self.total_pushed - self.events.len() as u64
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
