//! Interactive sessions: one PTY child, its reader thread, its history and
//! its subscribers, all driven from a single actor task.

mod actor;
pub mod config;
pub mod handle;
mod reader;
pub mod sequencer;

#[cfg(test)]
pub(crate) mod testing;

pub(crate) use actor::{spawn_session, SessionParams};
pub use config::SessionConfig;
pub use handle::{SessionHandle, WeakSessionHandle};
pub use sequencer::{BootstrapConfig, ReadinessProbe};

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Lifecycle of a session.
///
/// `Created → Starting → Running → Stopping → Stopped`, with `Failed`
/// (spawn error) and `Crashed` (unexpected end of output) as the other
/// terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Stopped | SessionState::Crashed | SessionState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Crashed => "crashed",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a session, published by its actor.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: String,
    pub owner_key: String,
    pub working_dir: PathBuf,
    pub state: SessionState,
    pub is_running: bool,
    pub client_count: usize,
    pub pid: Option<u32>,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}
