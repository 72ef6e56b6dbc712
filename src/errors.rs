//! Error types shared across the application.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The platform backend executable could not be located.
    ExecutableNotFound(String),
    /// The backend never answered its liveness probe within the budget.
    HealthTimeout(Duration),
    /// The backend process exited while it was expected to be running.
    ProcessExited(String),
    /// The operating system refused to spawn the backend process.
    Spawn(String),
    /// Network failure on a streaming turn.
    Stream(String),
    /// A single server-sent line could not be decoded.
    MalformedEvent(String),
    /// Hot-reload of an externally supervised backend failed.
    ConfigReload(String),
    /// Non-streaming HTTP call failure.
    Http(String),
    /// IPC communication failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Suggested next step for errors the user can act on.
    ///
    /// Returns `None` for failures that carry no actionable advice.
    #[must_use]
    pub fn user_hint(&self) -> Option<&'static str> {
        match self {
            Self::ExecutableNotFound(_) => Some(
                "no bundled backend for this platform; set `use_external_backend = true` \
                 and `external_backend_url` to use a backend you run yourself",
            ),
            Self::HealthTimeout(_) => Some(
                "the backend started but never answered /health; check the backend output \
                 or raise `backend.timeouts.health_seconds`",
            ),
            _ => None,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::ExecutableNotFound(path) => write!(f, "executable not found: {path}"),
            Self::HealthTimeout(elapsed) => write!(
                f,
                "health timeout: backend not healthy after {:.1}s",
                elapsed.as_secs_f64()
            ),
            Self::ProcessExited(msg) => write!(f, "process exited: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Stream(msg) => write!(f, "stream: {msg}"),
            Self::MalformedEvent(msg) => write!(f, "malformed event: {msg}"),
            Self::ConfigReload(msg) => write!(f, "config reload: {msg}"),
            Self::Http(msg) => write!(f, "http: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
