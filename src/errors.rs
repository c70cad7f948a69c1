//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every engine failure mode.
///
/// Errors are `Clone` because the engine records the last fatal error and
/// hands a copy to every subsequent caller until it is cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The agent binary could not be spawned. Fatal for the engine.
    Spawn(String),
    /// A line on the agent's stdout could not be decoded.
    Protocol(String),
    /// Caller misuse, e.g. starting a second query while one is active.
    Usage(String),
    /// The in-flight query was cancelled via `Engine::interrupt`.
    Interrupted,
    /// The agent process exited before the query produced a terminal event.
    Exited {
        /// Process exit code; `None` when terminated by a signal.
        code: Option<i32>,
        /// Tail of the process's stderr, newest line last.
        stderr: String,
    },
    /// The engine was stopped or an internal channel is gone.
    Closed(String),
    /// A control request was not answered in time.
    Timeout(String),
    /// File-system or pipe I/O failure.
    Io(String),
}

impl AppError {
    /// Whether this error came from an abnormal (non-zero, unplanned) exit.
    #[must_use]
    pub fn is_abnormal_exit(&self) -> bool {
        matches!(self, Self::Exited { code, .. } if *code != Some(0))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Usage(msg) => write!(f, "usage: {msg}"),
            Self::Interrupted => write!(f, "interrupted by user"),
            Self::Exited { code, stderr } => {
                match code {
                    Some(c) => write!(f, "exited: process exited with code {c}")?,
                    None => write!(f, "exited: process terminated by signal")?,
                }
                if !stderr.is_empty() {
                    write!(f, " ({stderr})")?;
                }
                Ok(())
            }
            Self::Closed(msg) => write!(f, "closed: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
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

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
