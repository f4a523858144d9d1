//! dockyard-core — shared data model for the Dockyard build orchestrator.
//!
//! Everything in this crate is plain data: job templates, container and
//! host views, the build/job status machine, bus events, configuration,
//! and environment-based host discovery. Nothing here talks to a
//! container runtime.

pub mod build;
pub mod config;
pub mod discovery;
pub mod event;
pub mod image;
pub mod types;

pub use build::{Build, BuildEvent, Job, Status, StatusError};
pub use config::{ConfigError, DockyardConfig};
pub use discovery::discover_hosts;
pub use event::Event;
pub use image::ImageName;
pub use types::*;
