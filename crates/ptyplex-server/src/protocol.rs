//! JSON control protocol spoken over WebSocket text frames.
//!
//! Inbound frames are [`ClientRequest`]s tagged by `type`. Outbound frames
//! are either session events (the core envelope plus `session_id`) or
//! replies to a request.

use ptyplex_core::OutputEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

/// A request from a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Create {
        session_id: Option<String>,
        owner_key: String,
        working_dir: PathBuf,
        /// Falls back to the configured default command.
        command: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_true")]
        start: bool,
    },
    Subscribe {
        session_id: String,
    },
    Unsubscribe {
        session_id: String,
    },
    Input {
        session_id: String,
        text: String,
    },
    Key {
        session_id: String,
        key: String,
    },
    Stop {
        session_id: String,
    },
    Remove {
        session_id: String,
        #[serde(default)]
        force: bool,
    },
    Status {
        session_id: String,
    },
    List,
    Ping,
}

impl ClientRequest {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Request name echoed in the reply.
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::Create { .. } => "create",
            ClientRequest::Subscribe { .. } => "subscribe",
            ClientRequest::Unsubscribe { .. } => "unsubscribe",
            ClientRequest::Input { .. } => "input",
            ClientRequest::Key { .. } => "key",
            ClientRequest::Stop { .. } => "stop",
            ClientRequest::Remove { .. } => "remove",
            ClientRequest::Status { .. } => "status",
            ClientRequest::List => "list",
            ClientRequest::Ping => "ping",
        }
    }
}

/// Outbound frame.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Frame {
    Event(SessionEvent),
    Reply(Reply),
}

impl Frame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// An event envelope, tagged with its session when it has one.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub event: OutputEvent,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, event: OutputEvent) -> Self {
        Self {
            session_id: Some(session_id.into()),
            event,
        }
    }

    pub fn pong() -> Self {
        Self {
            session_id: None,
            event: OutputEvent::pong(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename = "reply")]
pub struct Reply {
    pub request: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(request: &str, data: Option<Value>) -> Self {
        Self {
            request: request.to_string(),
            ok: true,
            data,
            error: None,
        }
    }

    pub fn err(request: &str, error: impl fmt::Display) -> Self {
        Self {
            request: request.to_string(),
            ok: false,
            data: None,
            error: Some(error.to_string()),
        }
    }

    /// Sent when a session drops this connection's subscription.
    pub fn detached(session_id: &str) -> Self {
        Self::ok("detached", Some(serde_json::json!({ "session_id": session_id })))
    }
}
