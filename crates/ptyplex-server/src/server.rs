//! Main server: accepts WebSocket connections and maps protocol requests
//! onto the session registry.

use crate::config::ServerConfig;
use crate::protocol::{ClientRequest, Frame, Reply, SessionEvent};
use crate::recording::TranscriptRecorder;
use crate::transport::websocket;
use ptyplex_core::{
    ClientId, ClientSink, CommandSpec, OutputEvent, PlexError, PlexResult, PtySpawner, SessionRegistry,
    SessionRequest,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Queue depth of a connection's outbound frames.
const OUTBOUND_QUEUE: usize = 256;

/// Sessions a connection is subscribed to, shared with its sinks.
type Subscriptions = Arc<Mutex<HashMap<String, ClientId>>>;

fn lock(subscriptions: &Subscriptions) -> MutexGuard<'_, HashMap<String, ClientId>> {
    subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client sink forwarding a session's events onto a connection.
///
/// Detach notices travel on their own unbounded channel so a full event
/// queue cannot swallow them.
struct WsClientSink {
    session_id: String,
    tx: mpsc::Sender<Frame>,
    detach_tx: mpsc::UnboundedSender<String>,
    subscriptions: Subscriptions,
    /// Set under the subscriptions lock when the session drops this sink.
    closed: Arc<AtomicBool>,
}

impl ClientSink for WsClientSink {
    fn send(&mut self, event: &OutputEvent) -> PlexResult<()> {
        let frame = Frame::Event(SessionEvent::new(self.session_id.clone(), event.clone()));
        self.tx.try_send(frame).map_err(|e| {
            PlexError::DeliveryFailed(match e {
                mpsc::error::TrySendError::Full(_) => "connection queue full".to_string(),
                mpsc::error::TrySendError::Closed(_) => "connection closed".to_string(),
            })
        })
    }

    fn close(&mut self) {
        {
            let mut subscriptions = lock(&self.subscriptions);
            self.closed.store(true, Ordering::Release);
            subscriptions.remove(&self.session_id);
        }
        let _ = self.detach_tx.send(self.session_id.clone());
    }
}

/// Per-connection state.
struct ConnectionContext {
    conn_id: u64,
    outbound_tx: mpsc::Sender<Frame>,
    detach_tx: mpsc::UnboundedSender<String>,
    subscriptions: Subscriptions,
}

impl ConnectionContext {
    fn new(conn_id: u64, queue: usize) -> (Self, mpsc::Receiver<Frame>, mpsc::UnboundedReceiver<String>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue);
        let (detach_tx, detach_rx) = mpsc::unbounded_channel();
        let ctx = Self {
            conn_id,
            outbound_tx,
            detach_tx,
            subscriptions: Arc::default(),
        };
        (ctx, outbound_rx, detach_rx)
    }

    fn subscription(&self, session_id: &str) -> Option<ClientId> {
        lock(&self.subscriptions).get(session_id).copied()
    }
}

pub struct PlexServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    next_conn_id: AtomicU64,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl PlexServer {
    pub fn new(config: ServerConfig) -> Self {
        let spawner = Arc::new(PtySpawner::new(config.cols, config.rows));
        let mut registry = SessionRegistry::new(spawner)
            .with_defaults(config.session.clone())
            .with_max_sessions(config.max_sessions);

        if let Some(dir) = &config.recording_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(path = %dir.display(), error = %e, "could not create recording dir");
            }
            info!(path = %dir.display(), "session transcripts enabled");
            registry = registry.with_hook(Arc::new(TranscriptRecorder::new(dir.clone())));
        }

        Self {
            config,
            registry: Arc::new(registry),
            next_conn_id: AtomicU64::new(1),
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Bind the listener and serve connections until every listener closes.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let (local_addr, ws_rx) = websocket::start_listener(self.config.listen_addr).await?;
        info!(addr = %local_addr, max_sessions = self.config.max_sessions, "ptyplex-server ready");
        self.serve(ws_rx).await;
        Ok(())
    }

    async fn serve(self: Arc<Self>, mut ws_rx: mpsc::Receiver<websocket::WebSocketConnection>) {
        let reaper = self.registry.clone();
        let reap_interval = self.config.reap_interval;
        let reap_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(reap_interval);
            loop {
                interval.tick().await;
                let removed = reaper.reap_terminated();
                if !removed.is_empty() {
                    info!(count = removed.len(), "reaped finished sessions");
                }
            }
        });

        while let Some(conn) = ws_rx.recv().await {
            let srv = self.clone();
            tokio::spawn(async move {
                if let Err(e) = srv.handle_websocket(conn).await {
                    warn!(error = %e, "WebSocket connection error");
                }
            });
        }

        info!("listener closed, shutting down");
        reap_task.abort();
    }

    /// Notify connections and stop every session.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.registry.shutdown_all().await;
    }

    async fn handle_websocket(&self, mut conn: websocket::WebSocketConnection) -> anyhow::Result<()> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let remote = conn.remote_addr;
        info!(conn_id, remote = %remote, "handling WebSocket connection");

        let (mut ctx, outbound_rx, detach_rx) = ConnectionContext::new(conn_id, OUTBOUND_QUEUE);

        let result = self.connection_loop(&mut conn, &mut ctx, outbound_rx, detach_rx).await;

        // Cleanup: drop every subscription this connection held.
        let held: Vec<(String, ClientId)> = lock(&ctx.subscriptions).drain().collect();
        for (session_id, client) in held {
            self.registry.unsubscribe(&session_id, client).await;
        }
        info!(conn_id, remote = %remote, "connection closed");
        result
    }

    async fn connection_loop(
        &self,
        conn: &mut websocket::WebSocketConnection,
        ctx: &mut ConnectionContext,
        mut outbound_rx: mpsc::Receiver<Frame>,
        mut detach_rx: mpsc::UnboundedReceiver<String>,
    ) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(conn_id = ctx.conn_id, "shutdown signal received, closing connection");
                    let notice = Frame::Event(SessionEvent {
                        session_id: None,
                        event: OutputEvent::system("server shutdown"),
                    });
                    let _ = websocket::ws_send_text(&mut conn.ws_stream, notice.to_json()?).await;
                    break;
                }

                Some(frame) = outbound_rx.recv() => {
                    websocket::ws_send_text(&mut conn.ws_stream, frame.to_json()?).await?;
                }

                Some(session_id) = detach_rx.recv() => {
                    let frame = Frame::Reply(Reply::detached(&session_id));
                    websocket::ws_send_text(&mut conn.ws_stream, frame.to_json()?).await?;
                }

                ws_result = websocket::ws_recv_text(&mut conn.ws_stream) => {
                    match ws_result {
                        Ok(Some(text)) => {
                            let frame = match ClientRequest::parse(&text) {
                                Ok(request) => self.dispatch_request(request, ctx).await,
                                Err(e) => {
                                    debug!(conn_id = ctx.conn_id, error = %e, "malformed request");
                                    Frame::Reply(Reply::err("invalid", e))
                                }
                            };
                            websocket::ws_send_text(&mut conn.ws_stream, frame.to_json()?).await?;
                        }
                        Ok(None) => {
                            debug!(conn_id = ctx.conn_id, "WebSocket session ended (peer closed)");
                            break;
                        }
                        Err(e) => {
                            debug!(conn_id = ctx.conn_id, error = %e, "WebSocket session ended");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn dispatch_request(&self, request: ClientRequest, ctx: &mut ConnectionContext) -> Frame {
        let name = request.name();
        let reply = match request {
            ClientRequest::Ping => return Frame::Event(SessionEvent::pong()),
            ClientRequest::Create {
                session_id,
                owner_key,
                working_dir,
                command,
                args,
                start,
            } => {
                let command = match command {
                    Some(program) => CommandSpec::new(program).args(args),
                    None => self.config.default_command.clone(),
                };
                let mut session_request = SessionRequest::new(owner_key, working_dir, command);
                if let Some(id) = session_id {
                    session_request = session_request.with_id(id);
                }
                self.create_session(session_request, start).await
            }
            ClientRequest::Subscribe { session_id } => self.subscribe(&session_id, ctx).await,
            ClientRequest::Unsubscribe { session_id } => {
                let held = lock(&ctx.subscriptions).remove(&session_id);
                match held {
                    Some(client) => {
                        let removed = self.registry.unsubscribe(&session_id, client).await;
                        Ok(Some(json!({ "removed": removed })))
                    }
                    None => Err(PlexError::Other(format!("not subscribed to {session_id}"))),
                }
            }
            ClientRequest::Input { session_id, text } => {
                if self.registry.send_input(&session_id, &text).await {
                    if let Ok(handle) = self.registry.get(&session_id) {
                        handle.announce(OutputEvent::user(text)).await;
                    }
                    Ok(None)
                } else {
                    Err(PlexError::NotRunning(session_id))
                }
            }
            ClientRequest::Key { session_id, key } => {
                if self.registry.send_key(&session_id, &key).await {
                    Ok(None)
                } else {
                    Err(PlexError::NotRunning(session_id))
                }
            }
            ClientRequest::Stop { session_id } => self.registry.stop(&session_id).await.map(|()| None),
            ClientRequest::Remove { session_id, force } => {
                let result = if force {
                    self.registry.force_remove(&session_id).await
                } else {
                    self.registry.remove(&session_id)
                };
                result.map(|()| None)
            }
            ClientRequest::Status { session_id } => self.registry.status(&session_id).and_then(to_data),
            ClientRequest::List => to_data(self.registry.list()),
        };

        Frame::Reply(match reply {
            Ok(data) => Reply::ok(name, data),
            Err(e) => {
                debug!(conn_id = ctx.conn_id, request = name, error = %e, "request failed");
                Reply::err(name, e)
            }
        })
    }

    async fn create_session(&self, request: SessionRequest, start: bool) -> PlexResult<Option<Value>> {
        let handle = self.registry.create(request)?;
        if start {
            handle.start().await?;
        }
        to_data(handle.status())
    }

    async fn subscribe(&self, session_id: &str, ctx: &ConnectionContext) -> PlexResult<Option<Value>> {
        // Entries are removed by the sink itself when the session drops it.
        if let Some(client) = ctx.subscription(session_id) {
            return Ok(Some(json!({ "client_id": client.0 })));
        }
        let closed = Arc::new(AtomicBool::new(false));
        let sink = WsClientSink {
            session_id: session_id.to_string(),
            tx: ctx.outbound_tx.clone(),
            detach_tx: ctx.detach_tx.clone(),
            subscriptions: ctx.subscriptions.clone(),
            closed: closed.clone(),
        };
        let client = self.registry.subscribe(session_id, Box::new(sink)).await?;
        {
            let mut subscriptions = lock(&ctx.subscriptions);
            if !closed.load(Ordering::Acquire) {
                subscriptions.insert(session_id.to_string(), client);
            }
        }
        Ok(Some(json!({ "client_id": client.0 })))
    }
}

fn to_data<T: Serialize>(value: T) -> PlexResult<Option<Value>> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| PlexError::Other(format!("cannot encode reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliOverrides, ConfigFile};
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_server() -> (Arc<PlexServer>, Client) {
        let overrides = CliOverrides {
            port: Some(0),
            ..CliOverrides::default()
        };
        let config = ServerConfig::resolve(ConfigFile::default(), overrides).unwrap();
        let server = Arc::new(PlexServer::new(config));
        let (addr, ws_rx) = websocket::start_listener(server.config.listen_addr).await.unwrap();
        tokio::spawn(server.clone().serve(ws_rx));
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
        (server, client)
    }

    async fn recv(client: &mut Client) -> Value {
        loop {
            let message = tokio::time::timeout(std::time::Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
                .unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn call(client: &mut Client, request: Value) -> Value {
        client.send(Message::Text(request.to_string().into())).await.unwrap();
        recv(client).await
    }

    #[tokio::test]
    async fn ping_and_list() {
        let (_server, mut client) = start_server().await;
        let pong = call(&mut client, json!({"type": "ping"})).await;
        assert_eq!(pong["type"], "pong");

        let list = call(&mut client, json!({"type": "list"})).await;
        assert_eq!(list, json!({"type": "reply", "request": "list", "ok": true, "data": []}));
    }

    #[tokio::test]
    async fn malformed_and_unknown() {
        let (_server, mut client) = start_server().await;
        let reply = call(&mut client, json!({"type": "explode"})).await;
        assert_eq!(reply["request"], "invalid");
        assert_eq!(reply["ok"], false);

        let reply = call(&mut client, json!({"type": "status", "session_id": "nope"})).await;
        assert_eq!(reply["ok"], false);
        assert!(reply["error"].as_str().unwrap().contains("not found"));

        let reply = call(&mut client, json!({"type": "input", "session_id": "nope", "text": "ls"})).await;
        assert_eq!(reply["ok"], false);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let (server, mut client) = start_server().await;
        let reply = call(
            &mut client,
            json!({"type": "create", "session_id": "s1", "owner_key": "t", "working_dir": "/definitely/not/here"}),
        )
        .await;
        assert_eq!(reply["request"], "create");
        assert_eq!(reply["ok"], false);
        assert!(reply["error"].as_str().unwrap().contains("spawn failed"));
        assert_eq!(server.registry.status("s1").unwrap().state, ptyplex_core::SessionState::Failed);

        let reply = call(&mut client, json!({"type": "remove", "session_id": "s1"})).await;
        assert_eq!(reply["ok"], true);
    }

    #[tokio::test]
    async fn subscribe_stop_detach_remove() {
        let (server, mut client) = start_server().await;
        let reply = call(
            &mut client,
            json!({"type": "create", "session_id": "s1", "owner_key": "t", "working_dir": "/tmp", "start": false}),
        )
        .await;
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["data"]["state"], "created");

        let reply = call(&mut client, json!({"type": "subscribe", "session_id": "s1"})).await;
        assert_eq!(reply["ok"], true);
        assert!(reply["data"]["client_id"].is_u64());
        assert_eq!(server.registry.status("s1").unwrap().client_count, 1);

        let reply = call(&mut client, json!({"type": "remove", "session_id": "s1"})).await;
        assert_eq!(reply["ok"], false);

        let reply = call(&mut client, json!({"type": "stop", "session_id": "s1"})).await;
        assert_eq!(reply["request"], "stop");
        assert_eq!(reply["ok"], true);
        let detached = recv(&mut client).await;
        assert_eq!(detached["request"], "detached");
        assert_eq!(detached["data"]["session_id"], "s1");

        let reply = call(&mut client, json!({"type": "remove", "session_id": "s1"})).await;
        assert_eq!(reply["ok"], true);
        assert_eq!(server.registry.count(), 0);
    }

    #[tokio::test]
    async fn lagging_subscription_is_detached_and_resubscribable() {
        let config = ServerConfig::resolve(ConfigFile::default(), CliOverrides::default()).unwrap();
        let server = PlexServer::new(config);
        let request = SessionRequest::new("t", "/tmp", CommandSpec::new("sh")).with_id("s1");
        let handle = server.registry.create(request).unwrap();
        let (mut ctx, mut outbound_rx, mut detach_rx) = ConnectionContext::new(1, 1);

        let first = server.subscribe("s1", &mut ctx).await.unwrap().unwrap();
        assert_eq!(handle.status().client_count, 1);

        // The second event overflows the one-slot queue.
        assert!(handle.announce(OutputEvent::system("one")).await);
        assert!(handle.announce(OutputEvent::system("two")).await);
        let detached = tokio::time::timeout(std::time::Duration::from_secs(2), detach_rx.recv())
            .await
            .expect("no detach notice")
            .unwrap();
        assert_eq!(detached, "s1");
        assert_eq!(ctx.subscription("s1"), None);
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while handle.status().client_count != 0 {
            assert!(tokio::time::Instant::now() < deadline, "lagging client not dropped");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        while outbound_rx.try_recv().is_ok() {}
        let second = server.subscribe("s1", &mut ctx).await.unwrap().unwrap();
        assert_ne!(first["client_id"], second["client_id"]);
        assert_eq!(handle.status().client_count, 1);
        let replay = outbound_rx.try_recv().unwrap();
        let replay: Value = serde_json::from_str(&replay.to_json().unwrap()).unwrap();
        assert_eq!(replay["type"], "history");
        assert_eq!(replay["session_id"], "s1");
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_drops_subscriptions() {
        let (server, mut client) = start_server().await;
        call(
            &mut client,
            json!({"type": "create", "session_id": "s1", "owner_key": "t", "working_dir": "/tmp", "start": false}),
        )
        .await;
        call(&mut client, json!({"type": "subscribe", "session_id": "s1"})).await;
        client.close(None).await.unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while server.registry.status("s1").unwrap().client_count != 0 {
            assert!(tokio::time::Instant::now() < deadline, "subscription not dropped");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        server.shutdown().await;
        assert_eq!(server.registry.count(), 0);
    }
}
