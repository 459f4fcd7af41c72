//! Completion hook: where a finished session's output leaves the core.

use crate::event::OutputEvent;
use crate::session::SessionState;
use std::path::PathBuf;

/// Everything known about a session once it reaches a terminal state.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub owner_key: String,
    pub working_dir: PathBuf,
    pub final_state: SessionState,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub ended_at: i64,
    /// Buffered history at the time the session ended.
    pub history: Vec<OutputEvent>,
}

/// Invoked exactly once per session, from its dispatch point.
///
/// Implementations must not block; spawn a task for slow work.
pub trait CompletionHook: Send + Sync {
    fn session_completed(&self, record: SessionRecord);
}
