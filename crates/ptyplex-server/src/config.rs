//! Server configuration: TOML file + CLI overrides.

use anyhow::{bail, Context};
use ptyplex_core::history::DEFAULT_HISTORY_CAPACITY;
use ptyplex_core::{BootstrapConfig, CommandSpec, ReadinessProbe, SessionConfig};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    pub bootstrap: Option<BootstrapSection>,
    pub recording: Option<RecordingSection>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// How often finished sessions are dropped from the registry.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
    /// Empty string disables the quit command.
    #[serde(default = "default_quit_command")]
    pub quit_command: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            history_capacity: default_history_capacity(),
            grace_period_ms: default_grace_period(),
            join_timeout_ms: default_join_timeout(),
            quit_command: default_quit_command(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

/// `[bootstrap]` section: command typed once the child prints a marker.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapSection {
    pub command: String,
    #[serde(default = "default_ready_markers")]
    pub ready_markers: Vec<String>,
    #[serde(default = "default_input_delay")]
    pub input_delay_ms: u64,
    #[serde(default = "default_submit_delay")]
    pub submit_delay_ms: u64,
}

/// `[recording]` section: where transcripts of finished sessions go.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingSection {
    pub dir: String,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7681
}
fn default_max_sessions() -> usize {
    ptyplex_core::registry::DEFAULT_MAX_SESSIONS
}
fn default_reap_interval() -> u64 {
    60
}
fn default_command() -> String {
    "bash".to_string()
}
fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}
fn default_grace_period() -> u64 {
    500
}
fn default_join_timeout() -> u64 {
    2000
}
fn default_quit_command() -> String {
    "exit".to_string()
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_ready_markers() -> Vec<String> {
    vec!["$ ".to_string(), "> ".to_string()]
}
fn default_input_delay() -> u64 {
    1000
}
fn default_submit_delay() -> u64 {
    500
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub max_sessions: Option<usize>,
    pub recording_dir: Option<String>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_sessions: usize,
    pub reap_interval: Duration,
    /// Command run when a `create` request names none.
    pub default_command: CommandSpec,
    pub session: SessionConfig,
    pub cols: u16,
    pub rows: u16,
    pub recording_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: CliOverrides) -> anyhow::Result<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)
                        .with_context(|| format!("cannot read {}", expanded.display()))?;
                    toml::from_str::<ConfigFile>(&content).context("config parse error")?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed file with CLI overrides.
    pub fn resolve(file: ConfigFile, overrides: CliOverrides) -> anyhow::Result<Self> {
        let bind = overrides.bind.unwrap_or(file.server.bind);
        let port = overrides.port.unwrap_or(file.server.port);
        let ip: IpAddr = bind
            .parse()
            .with_context(|| format!("invalid bind address: {bind}"))?;

        let session = &file.session;
        if session.command.trim().is_empty() {
            bail!("[session] command must not be empty");
        }
        let default_command = CommandSpec::new(session.command.trim()).args(session.args.iter().cloned());

        let bootstrap = file.bootstrap.map(|b| {
            BootstrapConfig::new(b.command, ReadinessProbe::contains_any(b.ready_markers)).with_delays(
                Duration::from_millis(b.input_delay_ms),
                Duration::from_millis(b.submit_delay_ms),
            )
        });
        let session_config = SessionConfig {
            history_capacity: session.history_capacity.max(1),
            grace_period: Duration::from_millis(session.grace_period_ms),
            join_timeout: Duration::from_millis(session.join_timeout_ms),
            quit_command: Some(session.quit_command.trim().to_string()).filter(|q| !q.is_empty()),
            bootstrap,
            ..SessionConfig::default()
        };

        let recording_dir = overrides
            .recording_dir
            .or(file.recording.map(|r| r.dir))
            .map(|dir| expand_tilde_str(&dir));

        Ok(Self {
            listen_addr: SocketAddr::new(ip, port),
            max_sessions: overrides.max_sessions.unwrap_or(file.server.max_sessions),
            reap_interval: Duration::from_secs(file.server.reap_interval_secs.max(1)),
            default_command,
            session: session_config,
            cols: session.cols,
            rows: session.rows,
            recording_dir,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
