//! ptyplex-server: PTY session multiplexer server.
//!
//! Spawns interactive programs on pseudo-terminals and streams their output
//! to WebSocket clients speaking a small JSON control protocol.

mod config;
mod protocol;
mod recording;
mod server;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::PlexServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// ptyplex-server — PTY session multiplexer
#[derive(Parser, Debug)]
#[command(name = "ptyplex-server", version, about = "PTY session multiplexer server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.ptyplex/config.toml")]
    config: String,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Directory for session transcripts
    #[arg(long)]
    recording_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting ptyplex-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        max_sessions: cli.max_sessions,
        recording_dir: cli.recording_dir,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to load config");
            std::process::exit(1);
        }
    };
    info!(
        addr = %server_config.listen_addr,
        command = %server_config.default_command.display(),
        "configuration loaded"
    );

    let server = Arc::new(PlexServer::new(server_config));

    let exit_code = tokio::select! {
        result = server.clone().run() => match result {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %format!("{e:#}"), "server error");
                1
            }
        },
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            0
        }
    };

    server.shutdown().await;
    info!("ptyplex-server stopped");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
