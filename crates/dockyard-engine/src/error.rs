//! Engine error types.

use thiserror::Error;

use dockyard_core::StatusError;
use dockyard_runtime::RuntimeError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The container outlived the build timeout.
    #[error("build timed out")]
    Timeout,

    #[error("job {job} of build {build} is not running")]
    JobNotRunning { build: i64, job: i64 },

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to encode build payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Status(#[from] StatusError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store backend error: {0}")]
    Backend(String),
}
