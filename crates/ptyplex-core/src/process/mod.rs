//! Process spawning contract.
//!
//! The session core never talks to the OS directly; it goes through a
//! [`ProcessSpawner`] that hands back a [`ChildProcess`]. The production
//! implementation is [`PtySpawner`], backed by portable-pty.

pub mod pty;

use crate::error::PlexResult;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub use pty::{PtyProcess, PtySpawner};

/// What to run inside the PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment variables on top of the inherited environment.
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Split a whitespace-separated command line. Returns `None` if empty.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).args(parts))
    }

    /// Command line for logs.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Result of a timed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were written into the buffer.
    Data(usize),
    /// Nothing arrived within the timeout.
    TimedOut,
    /// The output stream has ended.
    Eof,
}

/// Signals the multiplexer may deliver to a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Interrupt,
    Terminate,
    Kill,
}

/// A spawned interactive process attached to a PTY.
///
/// Methods take `&self`; the reader thread reads while the session writes.
pub trait ChildProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn is_alive(&self) -> bool;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> PlexResult<ReadOutcome>;

    fn write(&self, data: &[u8]) -> PlexResult<()>;

    fn send_signal(&self, signal: ProcessSignal) -> PlexResult<()>;

    /// Ask the process to exit; `force` escalates to a kill.
    fn terminate(&self, force: bool) -> PlexResult<()> {
        self.send_signal(if force {
            ProcessSignal::Kill
        } else {
            ProcessSignal::Terminate
        })
    }

    /// Block until the process exits. Returns the exit code.
    fn wait(&self) -> PlexResult<i32>;
}

/// Spawns interactive processes.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &CommandSpec, working_dir: &Path) -> PlexResult<Box<dyn ChildProcess>>;
}
