//! Reader loop: one OS thread per session doing timed PTY reads.
//!
//! The thread only ever pushes onto the bounded dispatch channel. It never
//! touches history, clients or state, and it exits on its own once the
//! stop flag is raised or the channel is closed.

use crate::decode::Utf8StreamDecoder;
use crate::error::{PlexError, PlexResult};
use crate::process::{ChildProcess, ReadOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Timed-out reads tolerated after the child has died, so the pump can
/// hand over whatever output is still in flight.
const DEAD_CHILD_POLLS: u32 = 2;

/// Messages from the reader thread to the dispatch point.
#[derive(Debug)]
pub(crate) enum ReaderMessage {
    Chunk(String),
    Eof,
    Failed(String),
}

/// Owner's side of a running reader thread.
pub(crate) struct ReaderHandle {
    stop: Arc<AtomicBool>,
    /// Resolves (by sender drop) when the thread body returns.
    finished: Option<oneshot::Receiver<()>>,
    thread: Option<JoinHandle<()>>,
}

pub(crate) struct ReaderOptions {
    pub chunk_size: usize,
    pub read_timeout: Duration,
}

impl ReaderHandle {
    pub(crate) fn spawn(
        session_id: &str,
        child: Arc<dyn ChildProcess>,
        tx: mpsc::Sender<ReaderMessage>,
        options: ReaderOptions,
    ) -> PlexResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let thread_stop = stop.clone();
        let id = session_id.to_string();
        let short_id: String = id.chars().take(8).collect();

        let thread = std::thread::Builder::new()
            .name(format!("pty-reader-{short_id}"))
            .spawn(move || {
                // Dropped when this closure returns or unwinds.
                let _done = done_tx;
                read_loop(&id, child.as_ref(), &tx, &thread_stop, &options);
            })
            .map_err(|e| PlexError::Spawn(format!("failed to start reader thread: {e}")))?;

        Ok(Self {
            stop,
            finished: Some(done_rx),
            thread: Some(thread),
        })
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Raise the stop flag and wait up to `timeout` for the thread to exit.
    ///
    /// Returns `false` if the thread was still running; it is then detached
    /// and will exit at its next read timeout.
    pub(crate) async fn join(mut self, session_id: &str, timeout: Duration) -> bool {
        self.request_stop();
        let finished = match self.finished.take() {
            Some(done) => tokio::time::timeout(timeout, done).await.is_ok(),
            None => true,
        };

        match self.thread.take() {
            Some(thread) if thread.is_finished() => {
                if thread.join().is_err() {
                    warn!(session_id, "reader thread panicked");
                }
            }
            Some(_detached) if !finished => {
                warn!(session_id, timeout_ms = timeout.as_millis() as u64, "reader thread did not exit in time, detaching");
            }
            _ => {}
        }
        finished
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.request_stop();
    }
}

fn read_loop(
    session_id: &str,
    child: &dyn ChildProcess,
    tx: &mpsc::Sender<ReaderMessage>,
    stop: &AtomicBool,
    options: &ReaderOptions,
) {
    let mut decoder = Utf8StreamDecoder::new();
    let mut buf = vec![0u8; options.chunk_size.max(1)];
    let mut dead_polls = 0;

    let ending = loop {
        if stop.load(Ordering::Acquire) {
            break None;
        }
        match child.read_timeout(&mut buf, options.read_timeout) {
            Ok(ReadOutcome::Data(n)) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() && !forward(session_id, tx, ReaderMessage::Chunk(text)) {
                    break None;
                }
            }
            Ok(ReadOutcome::TimedOut) => {
                if !child.is_alive() {
                    dead_polls += 1;
                    if dead_polls >= DEAD_CHILD_POLLS {
                        break Some(ReaderMessage::Eof);
                    }
                }
            }
            Ok(ReadOutcome::Eof) => break Some(ReaderMessage::Eof),
            Err(e) => {
                warn!(session_id, error = %e, "PTY read failed");
                break Some(ReaderMessage::Failed(e.to_string()));
            }
        }
    };

    if let Some(message) = ending {
        let tail = decoder.finish();
        if tail.is_empty() || forward(session_id, tx, ReaderMessage::Chunk(tail)) {
            forward(session_id, tx, message);
        }
    }
    if decoder.replaced() > 0 {
        debug!(session_id, replaced = decoder.replaced(), "invalid UTF-8 sequences replaced");
    }
    debug!(session_id, "reader loop finished");
}

/// Push onto the dispatch channel. `false` once the dispatch point is gone.
fn forward(session_id: &str, tx: &mpsc::Sender<ReaderMessage>, message: ReaderMessage) -> bool {
    if tx.blocking_send(message).is_err() {
        debug!(session_id, "dispatch point closed, dropping output");
        return false;
    }
    true
}
