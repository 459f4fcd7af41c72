//! The session actor: the single serialized dispatch point.
//!
//! Control commands and reader output are consumed by one task. Only this
//! task touches the state machine, the history buffer and the client set.

use super::config::SessionConfig;
use super::handle::{Command, SessionHandle, WeakSessionHandle};
use super::reader::{ReaderHandle, ReaderMessage, ReaderOptions};
use super::sequencer::InitSequencer;
use super::{SessionState, SessionStatus};
use crate::error::{PlexError, PlexResult};
use crate::event::{now_millis, OutputEvent};
use crate::history::HistoryBuffer;
use crate::hook::{CompletionHook, SessionRecord};
use crate::keys::translate_key;
use crate::process::{ChildProcess, CommandSpec, ProcessSignal, ProcessSpawner};
use crate::sink::{ClientId, ClientSink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Queue depth for control commands.
const COMMAND_QUEUE: usize = 64;

/// Liveness polling interval during the grace period.
const GRACE_POLL: Duration = Duration::from_millis(25);

/// Everything needed to bring up a session.
pub(crate) struct SessionParams {
    pub id: String,
    pub owner_key: String,
    pub working_dir: PathBuf,
    pub command: CommandSpec,
    pub config: SessionConfig,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub hook: Option<Arc<dyn CompletionHook>>,
}

/// Spawn the actor task and return its handle. Must run inside a tokio runtime.
pub(crate) fn spawn_session(params: SessionParams) -> SessionHandle {
    let created_at = now_millis();
    let initial = SessionStatus {
        id: params.id.clone(),
        owner_key: params.owner_key.clone(),
        working_dir: params.working_dir.clone(),
        state: SessionState::Created,
        is_running: false,
        client_count: 0,
        pid: None,
        created_at,
    };
    let (status_tx, status_rx) = watch::channel(initial);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);

    let weak_self = WeakSessionHandle::new(params.id.clone(), command_tx.downgrade(), status_rx.clone());
    let sequencer = params.config.bootstrap.clone().map(InitSequencer::new);
    let actor = SessionActor {
        history: HistoryBuffer::new(params.config.history_capacity),
        id: params.id,
        owner_key: params.owner_key,
        working_dir: params.working_dir,
        command: params.command,
        config: params.config,
        spawner: params.spawner,
        hook: params.hook,
        state: SessionState::Created,
        created_at,
        child: None,
        reader: None,
        reader_rx: None,
        clients: Vec::new(),
        next_client: 1,
        sequencer,
        weak_self,
        status_tx,
        completed: false,
    };
    let handle = SessionHandle::new(actor.id.clone(), command_tx, status_rx);
    tokio::spawn(actor.run(command_rx));
    handle
}

struct SessionActor {
    id: String,
    owner_key: String,
    working_dir: PathBuf,
    command: CommandSpec,
    config: SessionConfig,
    spawner: Arc<dyn ProcessSpawner>,
    hook: Option<Arc<dyn CompletionHook>>,
    state: SessionState,
    created_at: i64,
    child: Option<Arc<dyn ChildProcess>>,
    reader: Option<ReaderHandle>,
    reader_rx: Option<mpsc::Receiver<ReaderMessage>>,
    history: HistoryBuffer,
    clients: Vec<(ClientId, Box<dyn ClientSink>)>,
    next_client: u64,
    sequencer: Option<InitSequencer>,
    weak_self: WeakSessionHandle,
    status_tx: watch::Sender<SessionStatus>,
    completed: bool,
}

async fn next_reader_message(rx: &mut Option<mpsc::Receiver<ReaderMessage>>) -> Option<ReaderMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Run a blocking child operation off the async worker.
async fn on_child<R, F>(child: &Arc<dyn ChildProcess>, f: F) -> Option<R>
where
    R: Send + 'static,
    F: FnOnce(&dyn ChildProcess) -> R + Send + 'static,
{
    let child = child.clone();
    tokio::task::spawn_blocking(move || f(child.as_ref())).await.ok()
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        debug!(session_id = %self.id, "session actor started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                message = next_reader_message(&mut self.reader_rx) => {
                    self.handle_reader(message).await;
                }
            }
        }

        if !self.state.is_terminal() {
            info!(session_id = %self.id, "all handles dropped, stopping session");
            self.stop().await;
        }
        debug!(session_id = %self.id, "session actor finished");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { reply } => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::SendInput { text, reply } => {
                let ok = self.write_to_child(text.into_bytes(), "input").await;
                let _ = reply.send(ok);
            }
            Command::SendKey { key, reply } => {
                let ok = match translate_key(&key) {
                    Some(bytes) => self.write_to_child(bytes, "key").await,
                    None => {
                        debug!(session_id = %self.id, "empty key ignored");
                        false
                    }
                };
                let _ = reply.send(ok);
            }
            Command::Subscribe { sink, reply } => {
                let _ = reply.send(self.subscribe(sink));
            }
            Command::Unsubscribe { client, reply } => {
                let _ = reply.send(self.unsubscribe(client));
            }
            Command::Announce { event } => {
                if !self.state.is_terminal() {
                    self.dispatch(event);
                }
            }
            Command::History { reply } => {
                let _ = reply.send(self.history.snapshot());
            }
        }
    }

    async fn handle_reader(&mut self, message: Option<ReaderMessage>) {
        match message {
            Some(ReaderMessage::Chunk(text)) => {
                if self.state != SessionState::Running {
                    return;
                }
                let ready = self
                    .sequencer
                    .as_mut()
                    .is_some_and(|sequencer| sequencer.observe(&text));
                self.dispatch(OutputEvent::output(text));
                if ready {
                    if let Some(sequencer) = &self.sequencer {
                        sequencer.schedule(self.weak_self.clone());
                    }
                }
            }
            Some(ReaderMessage::Eof) => self.on_process_exit("process exited").await,
            Some(ReaderMessage::Failed(error)) => {
                self.on_process_exit(&format!("process output failed: {error}")).await;
            }
            None => {
                self.reader_rx = None;
                self.on_process_exit("process output closed").await;
            }
        }
    }

    // ── State machine ───────────────────────────────────────────────

    async fn start(&mut self) -> PlexResult<()> {
        match self.state {
            SessionState::Created => {}
            SessionState::Starting | SessionState::Running => return Ok(()),
            state => {
                return Err(PlexError::InvalidTransition(format!(
                    "cannot start session {} in state {state}",
                    self.id
                )))
            }
        }

        self.set_state(SessionState::Starting);
        info!(session_id = %self.id, command = %self.command.display(), cwd = %self.working_dir.display(), "starting session");

        let spawner = self.spawner.clone();
        let command = self.command.clone();
        let working_dir = self.working_dir.clone();
        let spawned = tokio::task::spawn_blocking(move || spawner.spawn(&command, &working_dir))
            .await
            .unwrap_or_else(|e| Err(PlexError::Spawn(format!("spawn task failed: {e}"))));
        let child: Arc<dyn ChildProcess> = match spawned {
            Ok(child) => Arc::from(child),
            Err(e) => return Err(self.fail(e)),
        };

        let (tx, rx) = mpsc::channel(self.config.dispatch_queue.max(1));
        let options = ReaderOptions {
            chunk_size: self.config.read_chunk,
            read_timeout: self.config.read_timeout,
        };
        let reader = match ReaderHandle::spawn(&self.id, child.clone(), tx, options) {
            Ok(reader) => reader,
            Err(e) => {
                on_child(&child, |c| c.terminate(true)).await;
                return Err(self.fail(e));
            }
        };

        self.child = Some(child);
        self.reader = Some(reader);
        self.reader_rx = Some(rx);
        self.set_state(SessionState::Running);
        info!(session_id = %self.id, pid = ?self.status_tx.borrow().pid, "session running");
        Ok(())
    }

    fn fail(&mut self, error: PlexError) -> PlexError {
        warn!(session_id = %self.id, error = %error, "session failed to start");
        self.set_state(SessionState::Failed);
        self.close_clients();
        self.complete();
        error
    }

    async fn stop(&mut self) {
        if self.state.is_terminal() {
            debug!(session_id = %self.id, state = %self.state, "stop on finished session ignored");
            return;
        }

        if self.state != SessionState::Created {
            info!(session_id = %self.id, "stopping session");
            self.set_state(SessionState::Stopping);
            if let Some(reader) = &self.reader {
                reader.request_stop();
            }
            if let Some(child) = self.child.clone() {
                self.interrupt_gracefully(&child).await;
            }
        }

        self.release().await;
        self.set_state(SessionState::Stopped);
        info!(session_id = %self.id, "session stopped");
        self.complete();
    }

    /// Interrupt plus quit command, then wait out the grace period.
    async fn interrupt_gracefully(&self, child: &Arc<dyn ChildProcess>) {
        let quit = self.config.quit_command.clone();
        let session_id = self.id.clone();
        on_child(child, move |c| {
            if let Err(e) = c.send_signal(ProcessSignal::Interrupt) {
                debug!(session_id = %session_id, error = %e, "interrupt failed");
            }
            if let Some(quit) = quit {
                if let Err(e) = c.write(format!("{quit}\r").as_bytes()) {
                    debug!(session_id = %session_id, error = %e, "quit command not delivered");
                }
            }
        })
        .await;

        let deadline = tokio::time::Instant::now() + self.config.grace_period;
        while child.is_alive() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(GRACE_POLL).await;
        }
    }

    async fn on_process_exit(&mut self, reason: &str) {
        if self.state != SessionState::Running {
            return;
        }
        warn!(session_id = %self.id, reason, "process ended unexpectedly");
        if let Some(reader) = &self.reader {
            reader.request_stop();
        }
        self.set_state(SessionState::Crashed);
        self.dispatch(OutputEvent::system(reason));
        self.release().await;
        self.complete();
    }

    /// Terminate, reap, join the reader and drop every client.
    async fn release(&mut self) {
        let join_timeout = self.config.join_timeout;
        if let Some(reader) = &self.reader {
            reader.request_stop();
        }
        // A reader blocked on a full queue sees the closure and returns.
        if let Some(rx) = self.reader_rx.as_mut() {
            rx.close();
        }

        if let Some(child) = self.child.take() {
            if child.is_alive() {
                warn!(session_id = %self.id, "child still alive, forcing termination");
                if let Some(Err(e)) = on_child(&child, |c| c.terminate(true)).await {
                    warn!(session_id = %self.id, error = %e, "terminate failed");
                }
            }
            match tokio::time::timeout(join_timeout, on_child(&child, |c| c.wait())).await {
                Ok(Some(Ok(code))) => debug!(session_id = %self.id, code, "child reaped"),
                Ok(Some(Err(e))) => warn!(session_id = %self.id, error = %e, "failed to reap child"),
                Ok(None) => warn!(session_id = %self.id, "reap task failed"),
                Err(_) => warn!(session_id = %self.id, "child not reaped in time"),
            }
        }

        if let Some(reader) = self.reader.take() {
            reader.join(&self.id, join_timeout).await;
        }
        self.reader_rx = None;
        self.close_clients();
    }

    fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        if let Some(hook) = &self.hook {
            hook.session_completed(SessionRecord {
                id: self.id.clone(),
                owner_key: self.owner_key.clone(),
                working_dir: self.working_dir.clone(),
                final_state: self.state,
                created_at: self.created_at,
                ended_at: now_millis(),
                history: self.history.snapshot(),
            });
        }
    }

    // ── Input ───────────────────────────────────────────────────────

    async fn write_to_child(&self, bytes: Vec<u8>, what: &'static str) -> bool {
        let Some(child) = self.child.as_ref().filter(|_| self.state == SessionState::Running) else {
            debug!(session_id = %self.id, state = %self.state, what, "write refused, session not running");
            return false;
        };
        match on_child(child, move |c| c.write(&bytes)).await {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                warn!(session_id = %self.id, error = %e, what, "write to PTY failed");
                false
            }
            None => false,
        }
    }

    // ── Broadcast ───────────────────────────────────────────────────

    /// Append to history, then fan out. Failed clients are removed after
    /// the pass over the client set.
    fn dispatch(&mut self, event: OutputEvent) {
        self.history.push(event.clone());

        let mut failed = Vec::new();
        for (client, sink) in &mut self.clients {
            if let Err(e) = sink.send(&event) {
                debug!(session_id = %self.id, client = %client, error = %e, "delivery failed");
                failed.push(*client);
            }
        }

        if !failed.is_empty() {
            self.clients.retain_mut(|(client, sink)| {
                if failed.contains(client) {
                    sink.close();
                    false
                } else {
                    true
                }
            });
            info!(session_id = %self.id, dropped = failed.len(), clients = self.clients.len(), "removed unreachable clients");
            self.publish_status();
        }
    }

    fn subscribe(&mut self, mut sink: Box<dyn ClientSink>) -> PlexResult<ClientId> {
        if self.state.is_terminal() {
            sink.close();
            return Err(PlexError::NotRunning(format!(
                "session {} is {}",
                self.id, self.state
            )));
        }

        if !self.history.is_empty() {
            let replay = OutputEvent::history(self.history.snapshot());
            if let Err(e) = sink.send(&replay) {
                sink.close();
                return Err(e);
            }
        }

        let client = ClientId(self.next_client);
        self.next_client += 1;
        self.clients.push((client, sink));
        info!(session_id = %self.id, client = %client, clients = self.clients.len(), "client subscribed");
        self.publish_status();
        Ok(client)
    }

    fn unsubscribe(&mut self, client: ClientId) -> bool {
        let Some(index) = self.clients.iter().position(|(id, _)| *id == client) else {
            return false;
        };
        let (_, mut sink) = self.clients.remove(index);
        sink.close();
        info!(session_id = %self.id, client = %client, clients = self.clients.len(), "client unsubscribed");
        self.publish_status();
        true
    }

    fn close_clients(&mut self) {
        if self.clients.is_empty() {
            return;
        }
        for (_, sink) in &mut self.clients {
            sink.close();
        }
        debug!(session_id = %self.id, count = self.clients.len(), "clients closed");
        self.clients.clear();
        self.publish_status();
    }

    // ── Status ──────────────────────────────────────────────────────

    fn set_state(&mut self, state: SessionState) {
        debug!(session_id = %self.id, from = %self.state, to = %state, "state transition");
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(SessionStatus {
            id: self.id.clone(),
            owner_key: self.owner_key.clone(),
            working_dir: self.working_dir.clone(),
            state: self.state,
            is_running: self.state == SessionState::Running,
            client_count: self.clients.len(),
            pid: self.child.as_ref().and_then(|c| c.pid()),
            created_at: self.created_at,
        });
    }
}
