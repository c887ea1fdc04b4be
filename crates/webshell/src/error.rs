use std::fmt;

use thiserror::Error;

use crate::session::{SessionId, SessionState};

pub type EngineResult<T> = Result<T, EngineError>;

/// Stable, caller-visible classification shared by every error in the crate.
///
/// `as_str` is what travels over the wire in `error:<kind>` status events
/// and in HTTP error bodies, so the strings must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    EngineUnavailable,
    ImagePullFailure,
    NameConflict,
    NotFound,
    AlreadyStarted,
    NotRunning,
    EngineTimeout,
    Engine,
    AlreadyAttached,
    NotAttached,
    Overloaded,
    ShuttingDown,
    Relay,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EngineUnavailable => "engine-unavailable",
            Self::ImagePullFailure => "image-pull",
            Self::NameConflict => "name-conflict",
            Self::NotFound => "not-found",
            Self::AlreadyStarted => "already-started",
            Self::NotRunning => "not-running",
            Self::EngineTimeout => "engine-timeout",
            Self::Engine => "engine",
            Self::AlreadyAttached => "already-attached",
            Self::NotAttached => "not-attached",
            Self::Overloaded => "overloaded",
            Self::ShuttingDown => "shutting-down",
            Self::Relay => "relay",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("container engine unavailable: {0}")]
    Unavailable(String),
    #[error("failed to pull image {image}: {message}")]
    ImagePullFailure { image: String, message: String },
    #[error("sandbox name already in use: {0}")]
    NameConflict(String),
    #[error("sandbox not found: {0}")]
    NotFound(String),
    #[error("sandbox already started: {0}")]
    AlreadyStarted(String),
    #[error("sandbox not running: {0}")]
    NotRunning(String),
    #[error("engine operation {operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
    #[error("engine operation {operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::EngineUnavailable,
            Self::ImagePullFailure { .. } => ErrorKind::ImagePullFailure,
            Self::NameConflict(_) => ErrorKind::NameConflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyStarted(_) => ErrorKind::AlreadyStarted,
            Self::NotRunning(_) => ErrorKind::NotRunning,
            Self::Timeout { .. } => ErrorKind::EngineTimeout,
            Self::Operation { .. } => ErrorKind::Engine,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("session is {0}, expected running")]
    NotRunning(SessionState),
    #[error("session has no attached stream")]
    NotAttached,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Engine(err) => err.kind(),
            Self::NotRunning(_) => ErrorKind::NotRunning,
            Self::NotAttached => ErrorKind::NotAttached,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("session {0} already has an attached channel")]
    AlreadyAttached(SessionId),
    #[error("session {0} is not running")]
    NotRunning(SessionId),
    #[error("max sessions reached ({max}); retry later")]
    Overloaded { max: usize },
    #[error("registry is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyAttached(_) => ErrorKind::AlreadyAttached,
            Self::NotRunning(_) => ErrorKind::NotRunning,
            Self::Overloaded { .. } => ErrorKind::Overloaded,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
            Self::Engine(err) => err.kind(),
        }
    }
}
