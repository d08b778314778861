//! Error taxonomy for the device runtime.
//!
//! Transport-level failures stay in [`TransportError`](crate::mqtt::transport::TransportError);
//! everything the client surfaces to its caller is a [`PepeunitError`].

use std::path::PathBuf;

use thiserror::Error;

use crate::mqtt::transport::TransportError;

/// Kind of transport operation wrapped by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Subscribe,
    Unsubscribe,
    Publish,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Subscribe => "subscribe",
            Operation::Unsubscribe => "unsubscribe",
            Operation::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the client, its connectivity layer and the update orchestrator.
#[derive(Debug, Error)]
pub enum PepeunitError {
    /// No handshake acknowledgement arrived within the connect timeout
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// The broker or the network refused the session
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] TransportError),

    /// Both attempts of a retried operation failed
    #[error("{operation} on '{topic}' failed: {cause}")]
    OperationFailed {
        operation: Operation,
        topic: String,
        cause: String,
    },

    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("apply failed: {0}")]
    ApplyFailed(String),

    /// Process spawn or image replacement did not happen
    #[error("restart failed: {0}")]
    RestartFailed(String),

    #[error("invalid auth token: {0}")]
    InvalidToken(String),

    #[error("settings error: {0}")]
    Settings(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PepeunitError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PepeunitError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        PepeunitError::Json {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = PepeunitError> = std::result::Result<T, E>;
