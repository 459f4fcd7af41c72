//! Output events delivered to subscribed clients.
//!
//! Every event serializes to the envelope `{"type", "content", "timestamp"}`.
//! `content` is a string except for `history` events, which carry the
//! ordered list of buffered events.

use serde::{Deserialize, Serialize};

/// Kind of an [`OutputEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Decoded terminal output.
    Output,
    /// Input echoed on behalf of a user.
    User,
    /// Lifecycle notice from the multiplexer.
    System,
    /// Error notice.
    Error,
    /// Replay of buffered events for a new subscriber.
    History,
    /// Reply to a client ping.
    Pong,
}

/// Payload of an [`OutputEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventContent {
    Text(String),
    Events(Vec<OutputEvent>),
}

/// A timestamped unit of terminal output or control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    #[serde(rename = "type")]
    kind: EventKind,
    content: EventContent,
    /// Milliseconds since the Unix epoch.
    timestamp: i64,
}

impl OutputEvent {
    fn text(kind: EventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: EventContent::Text(content.into()),
            timestamp: now_millis(),
        }
    }

    pub fn output(content: impl Into<String>) -> Self {
        Self::text(EventKind::Output, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(EventKind::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(EventKind::System, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::text(EventKind::Error, content)
    }

    pub fn pong() -> Self {
        Self::text(EventKind::Pong, "")
    }

    /// Build a replay event from buffered events (oldest first).
    pub fn history(events: Vec<OutputEvent>) -> Self {
        Self {
            kind: EventKind::History,
            content: EventContent::Events(events),
            timestamp: now_millis(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn content(&self) -> &EventContent {
        &self.content
    }

    /// Text content, or `None` for history events.
    pub fn text_content(&self) -> Option<&str> {
        match &self.content {
            EventContent::Text(text) => Some(text),
            EventContent::Events(_) => None,
        }
    }

    /// Replayed events, or `None` for non-history events.
    pub fn replayed(&self) -> Option<&[OutputEvent]> {
        match &self.content {
            EventContent::Events(events) => Some(events),
            EventContent::Text(_) => None,
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
