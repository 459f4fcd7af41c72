//! WebSocket listener using tokio-tungstenite.
//!
//! The control protocol is JSON carried in text frames; binary frames are
//! ignored.

use anyhow::{anyhow, bail, Context};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Maximum accepted size of an inbound frame (1 MiB).
pub const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields accepted
/// connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> anyhow::Result<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("WS bind failed on {bind_addr}"))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => {
                    debug!("connection receiver dropped, listener exiting");
                    break;
                }
                accepted = tcp_listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                    continue;
                }
            };

            let tx = tx.clone();
            tokio::spawn(async move {
                let ws_stream = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws_stream) => ws_stream,
                    Err(e) => {
                        warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                        return;
                    }
                };
                debug!(remote = %addr, "WebSocket connection accepted");
                let conn = WebSocketConnection {
                    ws_stream,
                    remote_addr: addr,
                };
                if tx.send(conn).await.is_err() {
                    warn!(remote = %addr, "connection receiver gone, dropping connection");
                }
            });
        }
    });

    Ok((local_addr, rx))
}

/// Send a text message over a WebSocket.
pub async fn ws_send_text(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    text: String,
) -> anyhow::Result<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| anyhow!("WS send failed: {e}"))
}

/// Receive the next text message from a WebSocket.
///
/// Returns `None` if the connection is closed. Binary messages are ignored.
/// Rejects frames larger than [`MAX_WS_FRAME_SIZE`].
pub async fn ws_recv_text(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
) -> anyhow::Result<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_WS_FRAME_SIZE {
                    bail!("WS frame too large: {} bytes (max {})", text.len(), MAX_WS_FRAME_SIZE);
                }
                return Ok(Some(text.to_string()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => bail!("WS recv failed: {e}"),
            None => return Ok(None),
        }
    }
}
