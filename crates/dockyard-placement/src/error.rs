//! Placement error types.

use thiserror::Error;

use dockyard_runtime::RuntimeError;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    /// Every candidate would overcommit, or none has the capacity.
    #[error("no resources available")]
    NoResources,

    /// A policy had to query the host and could not.
    #[error("host {host} could not be queried: {source}")]
    Host {
        host: String,
        #[source]
        source: RuntimeError,
    },
}

impl PlacementError {
    pub(crate) fn host(host: &str, source: RuntimeError) -> Self {
        PlacementError::Host {
            host: host.to_string(),
            source,
        }
    }
}
