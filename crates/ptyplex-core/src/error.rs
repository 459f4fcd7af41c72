use thiserror::Error;

/// Errors produced by the session multiplexer core.
#[derive(Debug, Error)]
pub enum PlexError {
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("session not running: {0}")]
    NotRunning(String),

    #[error("duplicate session: {0}")]
    DuplicateSession(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session still active: {0}")]
    SessionStillActive(String),

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("max sessions ({0}) reached")]
    CapacityReached(usize),

    #[error("session closed: {0}")]
    Closed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type PlexResult<T> = Result<T, PlexError>;
