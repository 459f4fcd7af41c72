//! ptyplex-core: interactive PTY session multiplexer.
//!
//! Spawns command-line programs on pseudo-terminals, streams their output
//! to any number of subscribed clients, keeps a bounded replay history and
//! exposes a small control surface (start, stop, text input, logical keys).

pub mod decode;
pub mod error;
pub mod event;
pub mod history;
pub mod hook;
pub mod keys;
pub mod process;
pub mod registry;
pub mod session;
pub mod sink;

// Re-export commonly used items at crate root.
pub use error::{PlexError, PlexResult};
pub use event::{EventContent, EventKind, OutputEvent};
pub use hook::{CompletionHook, SessionRecord};
pub use process::{CommandSpec, ProcessSpawner, PtySpawner};
pub use registry::{SessionRegistry, SessionRequest, SessionSummary};
pub use session::{BootstrapConfig, ReadinessProbe, SessionConfig, SessionHandle, SessionState, SessionStatus};
pub use sink::{ChannelSink, ClientId, ClientSink};
