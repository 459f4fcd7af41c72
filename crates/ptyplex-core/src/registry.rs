//! Session registry.
//!
//! Owns the id → session map. Creation, lookup, removal and garbage
//! collection of finished sessions go through here; everything else is
//! forwarded to the session's own handle.

use crate::error::{PlexError, PlexResult};
use crate::hook::CompletionHook;
use crate::process::{CommandSpec, ProcessSpawner};
use crate::session::{spawn_session, SessionConfig, SessionHandle, SessionParams, SessionState, SessionStatus};
use crate::sink::{ClientId, ClientSink};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Default cap on concurrently live sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 64;

/// Parameters for [`SessionRegistry::create`].
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Caller-chosen id; generated when `None`.
    pub id: Option<String>,
    /// Opaque correlation key, never interpreted.
    pub owner_key: String,
    pub working_dir: PathBuf,
    pub command: CommandSpec,
    /// Overrides the registry defaults for this session.
    pub config: Option<SessionConfig>,
}

impl SessionRequest {
    pub fn new(owner_key: impl Into<String>, working_dir: impl Into<PathBuf>, command: CommandSpec) -> Self {
        Self {
            id: None,
            owner_key: owner_key.into(),
            working_dir: working_dir.into(),
            command,
            config: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// Information returned when listing sessions.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub owner_key: String,
    pub state: SessionState,
    pub client_count: usize,
}

/// Process-wide map of sessions.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    spawner: Arc<dyn ProcessSpawner>,
    defaults: SessionConfig,
    max_sessions: usize,
    hook: Option<Arc<dyn CompletionHook>>,
}

impl SessionRegistry {
    pub fn new(spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            spawner,
            defaults: SessionConfig::default(),
            max_sessions: DEFAULT_MAX_SESSIONS,
            hook: None,
        }
    }

    /// Configuration used when a request carries none.
    pub fn with_defaults(mut self, defaults: SessionConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn CompletionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session in the `Created` state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(&self, request: SessionRequest) -> PlexResult<SessionHandle> {
        let mut sessions = self.sessions();

        let id = match request.id {
            Some(id) if sessions.contains_key(&id) => return Err(PlexError::DuplicateSession(id)),
            Some(id) => id,
            None => loop {
                let id = generate_session_id();
                if !sessions.contains_key(&id) {
                    break id;
                }
            },
        };

        let live = sessions.values().filter(|s| !s.state().is_terminal()).count();
        if live >= self.max_sessions {
            return Err(PlexError::CapacityReached(self.max_sessions));
        }

        let handle = spawn_session(SessionParams {
            id: id.clone(),
            owner_key: request.owner_key,
            working_dir: request.working_dir,
            command: request.command,
            config: request.config.unwrap_or_else(|| self.defaults.clone()),
            spawner: self.spawner.clone(),
            hook: self.hook.clone(),
        });
        sessions.insert(id.clone(), handle.clone());
        info!(session_id = %id, total = sessions.len(), "session created");
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> PlexResult<SessionHandle> {
        self.sessions()
            .get(id)
            .cloned()
            .ok_or_else(|| PlexError::SessionNotFound(id.to_string()))
    }

    /// Remove a finished session. Live sessions must be stopped first.
    pub fn remove(&self, id: &str) -> PlexResult<()> {
        let mut sessions = self.sessions();
        let state = sessions
            .get(id)
            .map(SessionHandle::state)
            .ok_or_else(|| PlexError::SessionNotFound(id.to_string()))?;
        if !state.is_terminal() {
            return Err(PlexError::SessionStillActive(format!("{id} is {state}")));
        }
        sessions.remove(id);
        info!(session_id = id, "session removed");
        Ok(())
    }

    /// Detach the session unconditionally, then stop it.
    pub async fn force_remove(&self, id: &str) -> PlexResult<()> {
        let handle = self
            .sessions()
            .remove(id)
            .ok_or_else(|| PlexError::SessionNotFound(id.to_string()))?;
        warn!(session_id = id, state = %handle.state(), "force-removing session");
        handle.stop().await
    }

    /// List all sessions, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut statuses: Vec<SessionStatus> = self.sessions().values().map(SessionHandle::status).collect();
        statuses.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        statuses
            .into_iter()
            .map(|s| SessionSummary {
                id: s.id,
                owner_key: s.owner_key,
                state: s.state,
                client_count: s.client_count,
            })
            .collect()
    }

    pub fn status(&self, id: &str) -> PlexResult<SessionStatus> {
        self.get(id).map(|handle| handle.status())
    }

    pub async fn start(&self, id: &str) -> PlexResult<()> {
        self.get(id)?.start().await
    }

    pub async fn stop(&self, id: &str) -> PlexResult<()> {
        self.get(id)?.stop().await
    }

    /// `false` if the session is unknown or not running.
    pub async fn send_input(&self, id: &str, text: &str) -> bool {
        match self.get(id) {
            Ok(handle) => handle.send_input(text).await,
            Err(_) => false,
        }
    }

    pub async fn send_key(&self, id: &str, key: &str) -> bool {
        match self.get(id) {
            Ok(handle) => handle.send_key(key).await,
            Err(_) => false,
        }
    }

    pub async fn subscribe(&self, id: &str, sink: Box<dyn ClientSink>) -> PlexResult<ClientId> {
        self.get(id)?.subscribe_boxed(sink).await
    }

    pub async fn unsubscribe(&self, id: &str, client: ClientId) -> bool {
        match self.get(id) {
            Ok(handle) => handle.unsubscribe(client).await,
            Err(_) => false,
        }
    }

    /// Drop every session in a terminal state. Returns the removed ids.
    pub fn reap_terminated(&self) -> Vec<String> {
        let mut sessions = self.sessions();
        let mut removed = Vec::new();
        sessions.retain(|id, handle| {
            if handle.state().is_terminal() {
                removed.push(id.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            debug!(count = removed.len(), "reaped finished sessions");
        }
        removed
    }

    /// Stop every session concurrently and empty the registry.
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = self.sessions().drain().map(|(_, handle)| handle).collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "stopping all sessions");
        let results = futures_util::future::join_all(handles.iter().map(|h| h.stop())).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                warn!(session_id = handle.id(), error = %e, "stop during shutdown failed");
            }
        }
    }

    pub fn count(&self) -> usize {
        self.sessions().len()
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{next_event, ScriptedControl, ScriptedProcess, ScriptedSpawner};
    use crate::sink::ChannelSink;
    use std::time::Duration;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            read_timeout: Duration::from_millis(10),
            grace_period: Duration::from_millis(100),
            join_timeout: Duration::from_millis(500),
            ..SessionConfig::default()
        }
    }

    fn registry(processes: usize) -> (SessionRegistry, Vec<ScriptedControl>) {
        let (processes, controls): (Vec<_>, Vec<_>) = (0..processes).map(|_| ScriptedProcess::new()).unzip();
        let spawner = Arc::new(ScriptedSpawner::with_processes(processes));
        (SessionRegistry::new(spawner).with_defaults(fast_config()), controls)
    }

    fn request(id: &str) -> SessionRequest {
        SessionRequest::new("task-1", "/tmp/proj", CommandSpec::new("cli")).with_id(id)
    }

    #[tokio::test]
    async fn create_and_get() {
        let (registry, _) = registry(1);
        let handle = registry.create(request("s1")).unwrap();
        assert_eq!(handle.id(), "s1");
        assert_eq!(handle.state(), SessionState::Created);
        assert_eq!(registry.get("s1").unwrap().id(), "s1");
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn generated_ids_are_hex() {
        let (registry, _) = registry(0);
        let handle = registry
            .create(SessionRequest::new("task", "/tmp", CommandSpec::new("cli")))
            .unwrap();
        assert_eq!(handle.id().len(), 32);
        assert!(handle.id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let (registry, _) = registry(0);
        registry.create(request("s1")).unwrap();
        let err = registry.create(request("s1")).unwrap_err();
        assert!(matches!(err, PlexError::DuplicateSession(id) if id == "s1"));
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn unknown_session() {
        let (registry, _) = registry(0);
        assert!(matches!(registry.get("nope"), Err(PlexError::SessionNotFound(_))));
        assert!(matches!(registry.remove("nope"), Err(PlexError::SessionNotFound(_))));
        assert!(matches!(registry.status("nope"), Err(PlexError::SessionNotFound(_))));
        assert!(!registry.send_input("nope", "hi").await);
        assert!(!registry.send_key("nope", "enter").await);
        assert!(!registry.unsubscribe("nope", ClientId(1)).await);
        let (sink, _rx) = ChannelSink::channel(1);
        let err = registry.subscribe("nope", Box::new(sink)).await.unwrap_err();
        assert!(matches!(err, PlexError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn capacity_counts_live_sessions() {
        let (registry, _) = registry(0);
        let registry = registry.with_max_sessions(2);
        registry.create(request("a")).unwrap();
        registry.create(request("b")).unwrap();
        let err = registry.create(request("c")).unwrap_err();
        assert!(matches!(err, PlexError::CapacityReached(2)));

        registry.stop("a").await.unwrap();
        registry.create(request("c")).unwrap();
        assert_eq!(registry.count(), 3);
    }

    #[tokio::test]
    async fn remove_requires_terminal_state() {
        let (registry, _controls) = registry(1);
        registry.create(request("s1")).unwrap();
        registry.start("s1").await.unwrap();

        let err = registry.remove("s1").unwrap_err();
        assert!(matches!(err, PlexError::SessionStillActive(_)));

        registry.stop("s1").await.unwrap();
        registry.remove("s1").unwrap();
        assert!(matches!(registry.get("s1"), Err(PlexError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn crashed_session_can_be_removed() {
        let (registry, controls) = registry(1);
        let handle = registry.create(request("s1")).unwrap();
        let (sink, mut rx) = ChannelSink::channel(8);
        registry.subscribe("s1", Box::new(sink)).await.unwrap();
        registry.start("s1").await.unwrap();

        controls[0].finish();
        let notice = next_event(&mut rx).await;
        assert_eq!(notice.kind(), crate::event::EventKind::System);
        assert_eq!(handle.wait_for_terminal().await, SessionState::Crashed);
        registry.remove("s1").unwrap();
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn force_remove_stops_live_session() {
        let (registry, controls) = registry(1);
        let handle = registry.create(request("s1")).unwrap();
        registry.start("s1").await.unwrap();

        registry.force_remove("s1").await.unwrap();
        assert_eq!(registry.count(), 0);
        assert_eq!(handle.state(), SessionState::Stopped);
        assert!(!controls[0].is_alive());
    }

    #[tokio::test]
    async fn facade_forwards_to_session() {
        let (registry, controls) = registry(1);
        registry.create(request("s1")).unwrap();
        assert!(!registry.send_input("s1", "early").await);
        registry.start("s1").await.unwrap();
        assert!(registry.send_input("s1", "hello").await);
        assert!(registry.send_key("s1", "enter").await);
        assert_eq!(controls[0].written(), "hello\r");

        let (sink, _rx) = ChannelSink::channel(8);
        let client = registry.subscribe("s1", Box::new(sink)).await.unwrap();
        assert_eq!(registry.status("s1").unwrap().client_count, 1);
        assert!(registry.unsubscribe("s1", client).await);
        assert_eq!(registry.status("s1").unwrap().client_count, 0);
        registry.stop("s1").await.unwrap();
    }

    #[tokio::test]
    async fn list_reports_every_session() {
        let (registry, _controls) = registry(1);
        registry.create(request("s1")).unwrap();
        registry.create(request("s2")).unwrap();
        registry.start("s1").await.unwrap();

        let summaries = registry.list();
        assert_eq!(summaries.len(), 2);
        let s1 = summaries.iter().find(|s| s.id == "s1").unwrap();
        assert_eq!(s1.state, SessionState::Running);
        assert_eq!(s1.owner_key, "task-1");
        let s2 = summaries.iter().find(|s| s.id == "s2").unwrap();
        assert_eq!(s2.state, SessionState::Created);
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn reap_removes_only_finished_sessions() {
        let (registry, _controls) = registry(1);
        registry.create(request("done")).unwrap();
        registry.create(request("live")).unwrap();
        registry.start("live").await.unwrap();
        registry.stop("done").await.unwrap();

        assert_eq!(registry.reap_terminated(), vec!["done".to_string()]);
        assert_eq!(registry.count(), 1);
        assert!(registry.reap_terminated().is_empty());
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let (registry, controls) = registry(2);
        let a = registry.create(request("a")).unwrap();
        let b = registry.create(request("b")).unwrap();
        registry.start("a").await.unwrap();
        registry.start("b").await.unwrap();

        registry.shutdown_all().await;
        assert_eq!(registry.count(), 0);
        assert_eq!(a.state(), SessionState::Stopped);
        assert_eq!(b.state(), SessionState::Stopped);
        assert!(controls.iter().all(|c| !c.is_alive()));
    }
}
