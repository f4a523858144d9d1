//! dockyardd — the Dockyard daemon.
//!
//! ```text
//!   dockyard.toml + env
//!          │
//!   ┌──────▼──────┐   hosts    ┌──────────┐
//!   │   Context   ├───────────►│ Cluster  │◄── POST /run, DELETE /destroy
//!   │             │   workers  ├──────────┤
//!   │             ├───────────►│  Engine  │◄── POST /builds
//!   └──────┬──────┘            └────┬─────┘
//!          │ runtime events         │ build/job events
//!          └──────────► EventBus ◄──┘──► GET /events
//! ```

pub mod context;
pub mod store;

pub use context::{Context, ResolvedHosts, default_schedulers, resolve_hosts};
pub use store::TracingStore;
