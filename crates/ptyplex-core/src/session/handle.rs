//! Cloneable control surface for a session actor.

use super::{SessionState, SessionStatus};
use crate::error::{PlexError, PlexResult};
use crate::event::OutputEvent;
use crate::sink::{ClientId, ClientSink};
use std::fmt;
use tokio::sync::{mpsc, oneshot, watch};

/// Requests marshalled onto the session's dispatch point.
pub(crate) enum Command {
    Start {
        reply: oneshot::Sender<PlexResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SendInput {
        text: String,
        reply: oneshot::Sender<bool>,
    },
    SendKey {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        sink: Box<dyn ClientSink>,
        reply: oneshot::Sender<PlexResult<ClientId>>,
    },
    Unsubscribe {
        client: ClientId,
        reply: oneshot::Sender<bool>,
    },
    Announce {
        event: OutputEvent,
    },
    History {
        reply: oneshot::Sender<Vec<OutputEvent>>,
    },
}

/// Handle to a running session. Cheap to clone.
///
/// When the last handle is dropped the session stops itself.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        id: String,
        commands: mpsc::Sender<Command>,
        status: watch::Receiver<SessionStatus>,
    ) -> Self {
        Self {
            id,
            commands,
            status,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Latest status published by the session.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Option<R> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Spawn the child process and start reading its output.
    pub async fn start(&self) -> PlexResult<()> {
        self.request(|reply| Command::Start { reply })
            .await
            .unwrap_or_else(|| Err(PlexError::Closed(self.id.clone())))
    }

    /// Stop the session. Returns once the stop sequence has completed;
    /// a second call is a no-op.
    pub async fn stop(&self) -> PlexResult<()> {
        // A session whose actor is gone has already released everything.
        self.request(|reply| Command::Stop { reply }).await;
        Ok(())
    }

    /// Write raw text to the child. `false` unless the session is running
    /// and the write succeeded.
    pub async fn send_input(&self, text: &str) -> bool {
        let text = text.to_string();
        self.request(|reply| Command::SendInput { text, reply })
            .await
            .unwrap_or(false)
    }

    /// Translate a logical key and write it to the child.
    pub async fn send_key(&self, key: &str) -> bool {
        let key = key.to_string();
        self.request(|reply| Command::SendKey { key, reply })
            .await
            .unwrap_or(false)
    }

    /// Add a client. If the session has history, the client first receives
    /// one `history` event.
    pub async fn subscribe<S>(&self, sink: S) -> PlexResult<ClientId>
    where
        S: ClientSink + 'static,
    {
        self.subscribe_boxed(Box::new(sink)).await
    }

    pub async fn subscribe_boxed(&self, sink: Box<dyn ClientSink>) -> PlexResult<ClientId> {
        self.request(|reply| Command::Subscribe { sink, reply })
            .await
            .unwrap_or_else(|| Err(PlexError::Closed(self.id.clone())))
    }

    /// Remove a client. Returns whether it was subscribed.
    pub async fn unsubscribe(&self, client: ClientId) -> bool {
        self.request(|reply| Command::Unsubscribe { client, reply })
            .await
            .unwrap_or(false)
    }

    /// Dispatch a control-layer event (e.g. echoed user input) to history and
    /// all clients. Returns `false` if the session is gone.
    pub async fn announce(&self, event: OutputEvent) -> bool {
        self.commands.send(Command::Announce { event }).await.is_ok()
    }

    /// Snapshot of the buffered history.
    pub async fn history(&self) -> PlexResult<Vec<OutputEvent>> {
        self.request(|reply| Command::History { reply })
            .await
            .ok_or_else(|| PlexError::Closed(self.id.clone()))
    }

    /// Wait until the session reaches a terminal state.
    pub async fn wait_for_terminal(&self) -> SessionState {
        let mut status = self.status.clone();
        if let Ok(current) = status.wait_for(|s| s.state.is_terminal()).await {
            return current.state;
        }
        let state = status.borrow().state;
        state
    }

    /// Weak handle that does not keep the session alive.
    pub fn downgrade(&self) -> WeakSessionHandle {
        WeakSessionHandle {
            id: self.id.clone(),
            commands: self.commands.downgrade(),
            status: self.status.clone(),
        }
    }
}

/// Non-owning counterpart of [`SessionHandle`].
#[derive(Clone)]
pub struct WeakSessionHandle {
    id: String,
    commands: mpsc::WeakSender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl WeakSessionHandle {
    pub(crate) fn new(
        id: String,
        commands: mpsc::WeakSender<Command>,
        status: watch::Receiver<SessionStatus>,
    ) -> Self {
        Self {
            id,
            commands,
            status,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn upgrade(&self) -> Option<SessionHandle> {
        let commands = self.commands.upgrade()?;
        Some(SessionHandle::new(self.id.clone(), commands, self.status.clone()))
    }
}

impl fmt::Debug for WeakSessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakSessionHandle").field("id", &self.id).finish()
    }
}
