use std::path::PathBuf;
use thiserror::Error;

/// Load-time failures. All of these are fatal and stop the run before any
/// session is started.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed transition matrix: {0}")]
    MalformedMatrix(String),

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed schedule token {token:?} at position {position}")]
    MalformedSchedule { position: usize, token: String },
}

impl LoadError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn matrix(msg: impl Into<String>) -> Self {
        Self::MalformedMatrix(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// A failed operation attempt reported by a request executor.
///
/// These never leave the session worker: they are logged and counted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestFailure {
    #[error("server answered with status {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected: {0}")]
    Rejected(String),
}
