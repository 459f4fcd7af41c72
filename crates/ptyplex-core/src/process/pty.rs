//! PTY-backed child process using portable-pty.
//!
//! portable-pty only offers a blocking master reader, so a pump thread
//! drains it into a channel and [`PtyProcess::read_timeout`] waits on that
//! channel with a deadline.

use super::{ChildProcess, CommandSpec, ProcessSignal, ProcessSpawner, ReadOutcome};
use crate::error::{PlexError, PlexResult};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Size of each blocking read performed by the pump thread.
const PUMP_CHUNK_SIZE: usize = 4096;

/// Spawns commands on a fresh native PTY.
#[derive(Debug, Clone, Copy)]
pub struct PtySpawner {
    cols: u16,
    rows: u16,
}

impl PtySpawner {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for PtySpawner {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl ProcessSpawner for PtySpawner {
    fn spawn(&self, command: &CommandSpec, working_dir: &Path) -> PlexResult<Box<dyn ChildProcess>> {
        let process = PtyProcess::spawn(command, working_dir, self.cols, self.rows)?;
        Ok(Box::new(process))
    }
}

/// A managed PTY child.
pub struct PtyProcess {
    /// Chunks read by the pump thread.
    output: Mutex<Receiver<std::io::Result<Vec<u8>>>>,
    /// Remainder of a chunk larger than the caller's buffer.
    leftover: Mutex<Vec<u8>>,
    writer: Mutex<Box<dyn Write + Send>>,
    /// Held so the master side stays open for the lifetime of the child.
    _master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawn `command` in `working_dir` on a PTY of the given size.
    pub fn spawn(command: &CommandSpec, working_dir: &Path, cols: u16, rows: u16) -> PlexResult<Self> {
        if command.program.trim().is_empty() {
            return Err(PlexError::Spawn("empty command".into()));
        }
        if !working_dir.is_dir() {
            return Err(PlexError::Spawn(format!(
                "working directory does not exist: {}",
                working_dir.display()
            )));
        }

        let pty_system = native_pty_system();
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = pty_system
            .openpty(size)
            .map_err(|e| PlexError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        cmd.cwd(working_dir);
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PlexError::Spawn(format!("failed to spawn {}: {e}", command.display())))?;
        // The child owns the slave now; keeping ours open would hide EOF.
        drop(pair.slave);

        let pid = child.process_id();
        info!(pid = ?pid, command = %command.display(), cwd = %working_dir.display(), cols, rows, "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PlexError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PlexError::Spawn(format!("failed to take PTY writer: {e}")))?;
        let killer = child.clone_killer();

        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name(format!("pty-pump-{}", pid.unwrap_or(0)))
            .spawn(move || pump(reader, tx))
            .map_err(|e| PlexError::Spawn(format!("failed to start PTY pump: {e}")))?;

        Ok(Self {
            output: Mutex::new(rx),
            leftover: Mutex::new(Vec::new()),
            writer: Mutex::new(writer),
            _master: Mutex::new(pair.master),
            child: Mutex::new(child),
            killer: Mutex::new(killer),
            pid,
        })
    }
}

fn pump(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<std::io::Result<Vec<u8>>>) {
    let mut buf = [0u8; PUMP_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
    debug!("PTY pump finished");
}

fn lock<'a, T: ?Sized>(mutex: &'a Mutex<T>, what: &str) -> PlexResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| PlexError::Other(format!("PTY {what} lock poisoned")))
}

impl ChildProcess for PtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        match self.child.try_lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            // Another thread is blocked in wait(); the child has not been reaped yet.
            Err(_) => true,
        }
    }

    fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> PlexResult<ReadOutcome> {
        let mut leftover = lock(&self.leftover, "leftover")?;
        if leftover.is_empty() {
            let output = lock(&self.output, "reader")?;
            match output.recv_timeout(timeout) {
                Ok(Ok(chunk)) => *leftover = chunk,
                Ok(Err(e)) => {
                    // Linux reports EIO once the slave side is gone.
                    return if self.is_alive() {
                        Err(PlexError::Io(e))
                    } else {
                        Ok(ReadOutcome::Eof)
                    };
                }
                Err(RecvTimeoutError::Timeout) => return Ok(ReadOutcome::TimedOut),
                Err(RecvTimeoutError::Disconnected) => return Ok(ReadOutcome::Eof),
            }
        }

        let n = leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&leftover[..n]);
        leftover.drain(..n);
        Ok(ReadOutcome::Data(n))
    }

    fn write(&self, data: &[u8]) -> PlexResult<()> {
        let mut writer = lock(&self.writer, "writer")?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn send_signal(&self, signal: ProcessSignal) -> PlexResult<()> {
        match signal {
            // The line discipline turns ETX into SIGINT for the foreground group.
            ProcessSignal::Interrupt => self.write(&[0x03]),
            ProcessSignal::Terminate | ProcessSignal::Kill => {
                let mut killer = lock(&self.killer, "killer")?;
                killer
                    .kill()
                    .map_err(|e| PlexError::Other(format!("kill failed: {e}")))
            }
        }
    }

    fn wait(&self) -> PlexResult<i32> {
        let mut child = lock(&self.child, "child")?;
        let status = child
            .wait()
            .map_err(|e| PlexError::Other(format!("wait error: {e}")))?;
        let code = i32::try_from(status.exit_code()).unwrap_or(-1);
        info!(pid = ?self.pid, code, "PTY child exited");
        Ok(code)
    }
}
