//! dockyard-engine — runs builds in ephemeral agent containers.
//!
//! ```text
//!   BuildTask ──► Engine::schedule
//!                    │
//!          ┌─────────▼─────────┐      ┌──────────────┐
//!          │     HostPool      │◄─────┤ allocate /   │
//!          │ (one build/host)  │      │ deallocate   │
//!          └─────────┬─────────┘      └──────────────┘
//!                    │ reserve
//!          ┌─────────▼─────────┐      ┌──────────────┐
//!          │ supervisor + jobs ├─────►│  BuildStore  │
//!          └─────────┬─────────┘      └──────────────┘
//!                    │ build / job events
//!          ┌─────────▼─────────┐
//!          │     EventBus      │──► subscribers
//!          └───────────────────┘
//! ```

pub mod bus;
pub mod engine;
pub mod error;
pub mod pool;
pub mod store;

pub use bus::{EventBus, SubscriptionId};
pub use engine::{
    BuildTask, ERROR_EXIT_CODE, Engine, INCOMPLETE_EXIT_CODE, KILLED_EXIT_CODE, classify,
    job_container_name, notify_container_name,
};
pub use error::{EngineError, EngineResult, StoreError, StoreResult};
pub use pool::HostPool;
pub use store::{BuildStore, MemoryStore};
