//! One-shot bootstrap once the child looks ready.
//!
//! The sequencer watches dispatched output for the first chunk accepted by
//! a [`ReadinessProbe`], then types the configured command after a delay
//! and presses enter after a second delay. The delayed steps run on their
//! own task and hold only a weak handle, so a session that stops in the
//! meantime simply causes them to be skipped.

use super::handle::WeakSessionHandle;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Predicate deciding whether an output chunk signals readiness.
#[derive(Clone)]
pub struct ReadinessProbe {
    description: String,
    check: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl ReadinessProbe {
    pub fn new<F>(description: impl Into<String>, check: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            check: Arc::new(check),
        }
    }

    /// Ready when the chunk contains any of `markers`.
    pub fn contains_any<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let markers: Vec<String> = markers.into_iter().map(Into::into).collect();
        let description = format!("contains any of {markers:?}");
        Self::new(description, move |chunk| {
            markers.iter().any(|m| !m.is_empty() && chunk.contains(m.as_str()))
        })
    }

    pub fn is_ready(&self, chunk: &str) -> bool {
        (self.check)(chunk)
    }
}

impl fmt::Debug for ReadinessProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadinessProbe").field(&self.description).finish()
    }
}

/// What to send once the child is ready.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub command: String,
    pub probe: ReadinessProbe,
    /// Delay between detecting readiness and typing the command.
    pub input_delay: Duration,
    /// Delay between typing the command and pressing enter.
    pub submit_delay: Duration,
}

impl BootstrapConfig {
    pub fn new(command: impl Into<String>, probe: ReadinessProbe) -> Self {
        Self {
            command: command.into(),
            probe,
            input_delay: Duration::from_millis(1000),
            submit_delay: Duration::from_millis(500),
        }
    }

    pub fn with_delays(mut self, input_delay: Duration, submit_delay: Duration) -> Self {
        self.input_delay = input_delay;
        self.submit_delay = submit_delay;
        self
    }
}

/// Per-session one-shot detector.
#[derive(Debug)]
pub(crate) struct InitSequencer {
    config: BootstrapConfig,
    fired: bool,
}

impl InitSequencer {
    pub(crate) fn new(config: BootstrapConfig) -> Self {
        Self {
            config,
            fired: false,
        }
    }

    /// Returns `true` for the first ready chunk only.
    pub(crate) fn observe(&mut self, chunk: &str) -> bool {
        if self.fired || !self.config.probe.is_ready(chunk) {
            return false;
        }
        self.fired = true;
        true
    }

    #[cfg(test)]
    pub(crate) fn has_fired(&self) -> bool {
        self.fired
    }

    /// Run the delayed bootstrap on a separate task.
    pub(crate) fn schedule(&self, session: WeakSessionHandle) {
        let command = self.config.command.clone();
        let input_delay = self.config.input_delay;
        let submit_delay = self.config.submit_delay;
        let session_id = session.id().to_string();
        info!(session_id = %session_id, "readiness detected, scheduling bootstrap");

        tokio::spawn(async move {
            tokio::time::sleep(input_delay).await;
            let Some(handle) = session.upgrade() else {
                debug!(session_id = %session_id, "session gone, bootstrap skipped");
                return;
            };
            if !handle.send_input(&command).await {
                debug!(session_id = %session_id, "session not running, bootstrap skipped");
                return;
            }
            drop(handle);

            tokio::time::sleep(submit_delay).await;
            let Some(handle) = session.upgrade() else {
                return;
            };
            if handle.send_key("enter").await {
                info!(session_id = %session_id, "bootstrap command submitted");
            } else {
                debug!(session_id = %session_id, "session not running, submit skipped");
            }
        });
    }
}
