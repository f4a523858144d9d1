//! dockyard-runtime — talking to container-runtime hosts.
//!
//! # Architecture
//!
//! ```text
//! Host (HostInfo + connection state)
//!   └── Arc<dyn ContainerRuntime>
//!         ├── HttpRuntime   REST over tcp:// or unix://
//!         └── MemoryRuntime in-process, scripted behaviors
//!
//! container_logs() ──► LogStream ──► Demuxer ──► stdout/stderr frames
//! events()         ──► EventStream of RuntimeEvent
//! ```

pub mod client;
pub mod demux;
pub mod error;
pub mod host;
pub mod memory;
pub mod runtime;
pub mod stream;
pub mod wire;

pub use client::{Endpoint, HttpRuntime};
pub use demux::{Demuxer, Frame, StreamKind};
pub use error::{RuntimeError, RuntimeResult};
pub use host::{ConnectionState, Host};
pub use memory::{Behavior, MemoryRuntime};
pub use runtime::{ContainerRuntime, LogOptions};
pub use stream::{EventStream, LogStream};
pub use wire::{ContainerInspect, ContainerSummary, CreateContainer, RuntimeEvent, Version};
