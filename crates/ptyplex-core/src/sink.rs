//! Client sinks: the boundary between a session and a realtime transport.

use crate::error::{PlexError, PlexResult};
use crate::event::OutputEvent;
use std::fmt;
use tokio::sync::mpsc;

/// Identifier handed out by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Something that can receive session events.
///
/// `send` must not block: it runs on the session's dispatch point.
/// A failed send unsubscribes the client. The session actor holds its
/// sinks across awaits, so they must be `Sync`.
pub trait ClientSink: Send + Sync {
    fn send(&mut self, event: &OutputEvent) -> PlexResult<()>;

    /// Called once when the session drops the client.
    fn close(&mut self);
}

/// Sink that forwards events into a bounded tokio channel.
///
/// Closing drops the sender, so the receiving side sees end-of-stream.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<OutputEvent>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<OutputEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Create a sink with its receiving half.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutputEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

impl ClientSink for ChannelSink {
    fn send(&mut self, event: &OutputEvent) -> PlexResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| PlexError::DeliveryFailed("sink closed".into()))?;
        tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PlexError::DeliveryFailed("client lagging".into()),
            mpsc::error::TrySendError::Closed(_) => {
                PlexError::DeliveryFailed("client disconnected".into())
            }
        })
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_until_closed() {
        let (mut sink, mut rx) = ChannelSink::channel(4);
        sink.send(&OutputEvent::output("one")).unwrap();
        sink.close();
        assert!(sink.send(&OutputEvent::output("two")).is_err());
        assert_eq!(rx.recv().await.unwrap().text_content(), Some("one"));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn full_channel_fails_delivery() {
        let (mut sink, _rx) = ChannelSink::channel(1);
        sink.send(&OutputEvent::output("a")).unwrap();
        let err = sink.send(&OutputEvent::output("b")).unwrap_err();
        assert!(matches!(err, PlexError::DeliveryFailed(_)));
    }

    #[tokio::test]
    async fn boxes_as_client_sink() {
        let (sink, _rx) = ChannelSink::channel(1);
        let boxed: Box<dyn ClientSink> = Box::new(sink);
        drop(boxed);
    }

    #[test]
    fn dropped_receiver_fails_delivery() {
        let (mut sink, rx) = ChannelSink::channel(1);
        drop(rx);
        assert!(sink.send(&OutputEvent::output("a")).is_err());
    }
}
