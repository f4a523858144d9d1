//! Dockyard placement — which host runs a job.
//!
//! # Components
//!
//! - **`admission`** — per-host policies (labels, affinity, uniqueness,
//!   ports, image cache) and their AND composition
//! - **`scorer`** — least-loaded selection among admitted hosts

pub mod admission;
pub mod error;
pub mod scorer;

pub use admission::{Admit, HOST_CONSTRAINT_PREFIX, Policy};
pub use error::{PlacementError, PlacementResult};
pub use scorer::{HostScore, place, rank_hosts, score_host};
