//! Runtime error types.

use thiserror::Error;

/// Result type alias for container-runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors returned while talking to a container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid runtime address: {0}")]
    InvalidAddress(String),

    #[error("runtime connection failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("runtime transport error: {0}")]
    Transport(#[from] hyper::Error),

    #[error("invalid runtime request: {0}")]
    Request(#[from] http::Error),

    #[error("runtime returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("no such container: {0}")]
    NoSuchContainer(String),

    #[error("no such image: {0}")]
    NoSuchImage(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("failed to decode runtime response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("malformed log stream: {0}")]
    Demux(String),
}

impl RuntimeError {
    /// Whether the error means the runtime could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RuntimeError::Connect(_) | RuntimeError::Transport(_))
    }
}
