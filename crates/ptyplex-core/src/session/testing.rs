//! In-memory process doubles for session tests.

use crate::error::{PlexError, PlexResult};
use crate::event::OutputEvent;
use crate::process::{ChildProcess, CommandSpec, ProcessSignal, ProcessSpawner, ReadOutcome};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc as tokio_mpsc;

enum Script {
    Data(Vec<u8>),
    Eof,
    Fail(String),
}

#[derive(Default)]
struct Shared {
    alive: AtomicBool,
    exit_on_interrupt: AtomicBool,
    fail_writes: AtomicBool,
    /// Milliseconds each read blocks before timing out; 0 means no stall.
    read_stall_ms: AtomicU64,
    writes: Mutex<Vec<u8>>,
    signals: Mutex<Vec<ProcessSignal>>,
}

/// A child whose output is fed by a [`ScriptedControl`].
pub(crate) struct ScriptedProcess {
    rx: Mutex<Receiver<Script>>,
    tx: Sender<Script>,
    ended: AtomicBool,
    shared: Arc<Shared>,
}

/// Test-side controls for a [`ScriptedProcess`].
#[derive(Clone)]
pub(crate) struct ScriptedControl {
    tx: Sender<Script>,
    shared: Arc<Shared>,
}

impl ScriptedProcess {
    pub(crate) fn new() -> (Self, ScriptedControl) {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared::default());
        shared.alive.store(true, Ordering::SeqCst);
        shared.exit_on_interrupt.store(true, Ordering::SeqCst);
        let control = ScriptedControl {
            tx: tx.clone(),
            shared: shared.clone(),
        };
        let process = Self {
            rx: Mutex::new(rx),
            tx,
            ended: AtomicBool::new(false),
            shared,
        };
        (process, control)
    }

    fn exit(&self) {
        if self.shared.alive.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Script::Eof);
        }
    }
}

impl ScriptedControl {
    pub(crate) fn emit(&self, text: &str) {
        self.emit_bytes(text.as_bytes());
    }

    pub(crate) fn emit_bytes(&self, bytes: &[u8]) {
        let _ = self.tx.send(Script::Data(bytes.to_vec()));
    }

    /// Simulate the child exiting on its own.
    pub(crate) fn finish(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Script::Eof);
    }

    pub(crate) fn fail(&self, message: &str) {
        let _ = self.tx.send(Script::Fail(message.to_string()));
    }

    /// Whether an interrupt is enough to make the child exit.
    pub(crate) fn set_exit_on_interrupt(&self, exits: bool) {
        self.shared.exit_on_interrupt.store(exits, Ordering::SeqCst);
    }

    /// Make every read block for `stall`, ignoring its own timeout.
    pub(crate) fn set_read_stall(&self, stall: Duration) {
        self.shared.read_stall_ms.store(stall.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn written(&self) -> String {
        let writes = self.shared.writes.lock().unwrap();
        String::from_utf8_lossy(&writes).into_owned()
    }

    pub(crate) fn signals(&self) -> Vec<ProcessSignal> {
        self.shared.signals.lock().unwrap().clone()
    }
}

impl ChildProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> PlexResult<ReadOutcome> {
        let stall = self.shared.read_stall_ms.load(Ordering::SeqCst);
        if stall > 0 {
            std::thread::sleep(Duration::from_millis(stall));
            return Ok(ReadOutcome::TimedOut);
        }
        if self.ended.load(Ordering::SeqCst) {
            return Ok(ReadOutcome::Eof);
        }
        let rx = self.rx.lock().unwrap();
        match rx.recv_timeout(timeout) {
            Ok(Script::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(ReadOutcome::Data(n))
            }
            Ok(Script::Eof) | Err(RecvTimeoutError::Disconnected) => {
                self.ended.store(true, Ordering::SeqCst);
                Ok(ReadOutcome::Eof)
            }
            Ok(Script::Fail(message)) => Err(PlexError::Other(message)),
            Err(RecvTimeoutError::Timeout) => Ok(ReadOutcome::TimedOut),
        }
    }

    fn write(&self, data: &[u8]) -> PlexResult<()> {
        if self.shared.fail_writes.load(Ordering::SeqCst) || !self.is_alive() {
            return Err(PlexError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "scripted write failure",
            )));
        }
        self.shared.writes.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn send_signal(&self, signal: ProcessSignal) -> PlexResult<()> {
        self.shared.signals.lock().unwrap().push(signal);
        match signal {
            ProcessSignal::Interrupt => {
                if self.shared.exit_on_interrupt.load(Ordering::SeqCst) {
                    self.exit();
                }
            }
            ProcessSignal::Terminate | ProcessSignal::Kill => self.exit(),
        }
        Ok(())
    }

    fn wait(&self) -> PlexResult<i32> {
        while self.is_alive() {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(0)
    }
}

/// Spawner handing out pre-built scripted processes.
pub(crate) struct ScriptedSpawner {
    processes: Mutex<VecDeque<ScriptedProcess>>,
    failure: Option<String>,
    spawned: AtomicUsize,
}

impl ScriptedSpawner {
    pub(crate) fn with_process(process: ScriptedProcess) -> Self {
        Self::with_processes([process])
    }

    /// Processes are handed out in order, one per spawn.
    pub(crate) fn with_processes(processes: impl IntoIterator<Item = ScriptedProcess>) -> Self {
        Self {
            processes: Mutex::new(processes.into_iter().collect()),
            failure: None,
            spawned: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self {
            processes: Mutex::new(VecDeque::new()),
            failure: Some(message.to_string()),
            spawned: AtomicUsize::new(0),
        }
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl ProcessSpawner for ScriptedSpawner {
    fn spawn(&self, _command: &CommandSpec, _working_dir: &Path) -> PlexResult<Box<dyn ChildProcess>> {
        if let Some(message) = &self.failure {
            return Err(PlexError::Spawn(message.clone()));
        }
        let process = self
            .processes
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PlexError::Spawn("no scripted process left".into()))?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(process))
    }
}

/// Next event on a sink channel, failing the test after two seconds.
pub(crate) async fn next_event(rx: &mut tokio_mpsc::Receiver<OutputEvent>) -> OutputEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("sink closed")
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
