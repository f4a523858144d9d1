//! dockyard-api — HTTP control surface for Dockyard.
//!
//! Thin axum handlers over the [`Cluster`] and the build [`Engine`].
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/run` | Place and start a JobSpec (`?pull=true` pulls first) |
//! | DELETE | `/destroy` | Kill and remove a running container |
//! | GET | `/containers` | List containers on every host |
//! | GET | `/engines` | List registered hosts |
//! | POST | `/builds` | Queue a build task |
//! | DELETE | `/builds/{build}/jobs/{job}` | Cancel a running job |
//! | GET | `/events` | Bus events as server-sent events |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};

use dockyard_cluster::Cluster;
use dockyard_engine::Engine;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<Cluster>,
    pub engine: Engine,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/run", post(handlers::run_container))
        .route("/destroy", delete(handlers::destroy_container))
        .route("/containers", get(handlers::list_containers))
        .route("/engines", get(handlers::list_engines))
        .route("/builds", post(handlers::submit_build))
        .route("/builds/{build}/jobs/{job}", delete(handlers::cancel_job))
        .route("/events", get(handlers::events))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
