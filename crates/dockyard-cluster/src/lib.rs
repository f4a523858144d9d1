//! dockyard-cluster — the job-target side of Dockyard.
//!
//! # Architecture
//!
//! ```text
//! Cluster (one mutex)
//!   ├── hosts:      HostId → Host
//!   ├── schedulers: job type → Policy
//!   └── start(job)
//!         ├── policy.admit(job, host) for every host
//!         ├── host.snapshot() for admitted hosts
//!         ├── place(job, snapshots)
//!         └── host.start(job)
//! ```
//!
//! Stop, kill, remove and logs are routed by the container's `host_id`.

pub mod cluster;
pub mod error;

pub use cluster::{Cluster, DEFAULT_STOP_TIMEOUT_SECS, HostStatus, LogRequest};
pub use error::{ClusterError, ClusterResult};
