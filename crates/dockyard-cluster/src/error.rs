//! Cluster error types.

use thiserror::Error;

use dockyard_placement::PlacementError;
use dockyard_runtime::RuntimeError;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("no scheduler registered for type {0:?}")]
    NoScheduler(String),

    #[error("no eligible hosts")]
    NoEligibleHosts,

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("host already registered: {0}")]
    DuplicateHost(String),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}
