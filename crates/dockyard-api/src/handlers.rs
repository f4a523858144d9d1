//! HTTP handlers.
//!
//! Container routes go through the `Cluster`, build routes through the
//! `Engine`. Every JSON response uses the same envelope.

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use dockyard_cluster::ClusterError;
use dockyard_core::{Event, JobSpec, RunningContainer};
use dockyard_engine::{BuildTask, EngineError};
use dockyard_placement::PlacementError;
use dockyard_runtime::RuntimeError;

use crate::AppState;

/// Undelivered events held per `/events` client before drops start.
const EVENT_BUFFER: usize = 256;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn runtime_status(e: &RuntimeError) -> StatusCode {
    match e {
        RuntimeError::NoSuchContainer(_) | RuntimeError::NoSuchImage(_) => StatusCode::NOT_FOUND,
        RuntimeError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn cluster_status(e: &ClusterError) -> StatusCode {
    match e {
        ClusterError::NoScheduler(_)
        | ClusterError::NoEligibleHosts
        | ClusterError::Placement(PlacementError::NoResources) => StatusCode::BAD_REQUEST,
        ClusterError::HostNotFound(_) => StatusCode::NOT_FOUND,
        ClusterError::DuplicateHost(_) => StatusCode::CONFLICT,
        ClusterError::Runtime(e) | ClusterError::Placement(PlacementError::Host { source: e, .. }) => {
            runtime_status(e)
        }
    }
}

fn cluster_error(e: ClusterError) -> axum::response::Response {
    let status = cluster_status(&e);
    if status.is_server_error() {
        warn!(error = %e, "cluster request failed");
    }
    error_response(&e.to_string(), status)
}

fn engine_error(e: EngineError) -> axum::response::Response {
    let status = match &e {
        EngineError::JobNotRunning { .. } => StatusCode::NOT_FOUND,
        EngineError::Runtime(e) => runtime_status(e),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

// ── Containers ─────────────────────────────────────────────────

#[derive(Debug, Default, serde::Deserialize)]
pub struct RunParams {
    #[serde(default)]
    pub pull: bool,
}

/// POST /run
pub async fn run_container(
    State(state): State<AppState>,
    Query(params): Query<RunParams>,
    Json(job): Json<JobSpec>,
) -> impl IntoResponse {
    match state.cluster.start(&job, params.pull).await {
        Ok(container) => (StatusCode::CREATED, ApiResponse::ok(container)).into_response(),
        Err(e) => cluster_error(e),
    }
}

/// DELETE /destroy
pub async fn destroy_container(
    State(state): State<AppState>,
    Json(container): Json<RunningContainer>,
) -> impl IntoResponse {
    match state.cluster.destroy(&container).await {
        Ok(()) => ApiResponse::ok("destroyed").into_response(),
        Err(e) => cluster_error(e),
    }
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub all: bool,
}

/// GET /containers
pub async fn list_containers(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    ApiResponse::ok(state.cluster.list_containers(params.all).await)
}

/// GET /engines
pub async fn list_engines(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::ok(state.cluster.hosts().await)
}

// ── Builds ─────────────────────────────────────────────────────

/// POST /builds
pub async fn submit_build(
    State(state): State<AppState>,
    Json(task): Json<BuildTask>,
) -> impl IntoResponse {
    if state.engine.pool().is_empty().await {
        return error_response("no build hosts available", StatusCode::SERVICE_UNAVAILABLE);
    }
    let build = task.build.id;
    info!(build, jobs = task.jobs.len(), "build submitted");
    // the supervisor owns the build from here; its handle is not needed
    drop(state.engine.schedule(task));
    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(serde_json::json!({ "build": build, "status": "queued" })),
    )
        .into_response()
}

/// DELETE /builds/{build}/jobs/{job}
pub async fn cancel_job(
    State(state): State<AppState>,
    Path((build, job)): Path<(i64, i64)>,
) -> impl IntoResponse {
    match state.engine.cancel(build, job).await {
        Ok(()) => ApiResponse::ok("cancelled").into_response(),
        Err(e) => engine_error(e),
    }
}

// ── Events ─────────────────────────────────────────────────────

/// GET /events
///
/// The subscription is pruned by the bus once the client goes away and
/// its channel closes.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (id, rx) = state.engine.bus().channel(EVENT_BUFFER);
    debug!(subscription = id, "event stream opened");
    let stream = ReceiverStream::new(rx).map(|ev| Ok(to_sse(&ev)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Build and job events carry their JSON record as payload; runtime
/// events carry none and are described by their container and host.
fn to_sse(ev: &Event) -> SseEvent {
    let data = if ev.payload.is_empty() {
        serde_json::json!({
            "container": ev.container,
            "host": ev.host,
            "time": ev.time,
        })
        .to_string()
    } else {
        String::from_utf8_lossy(&ev.payload).into_owned()
    };
    SseEvent::default().event(&ev.name).data(data)
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use dockyard_cluster::Cluster;
    use dockyard_core::config::EngineConfig;
    use dockyard_core::{ContainerState, HostInfo};
    use dockyard_engine::{Engine, EventBus, MemoryStore};
    use dockyard_placement::Policy;
    use dockyard_runtime::{Behavior, Host, MemoryRuntime};

    async fn test_state() -> AppState {
        let runtime = Arc::new(MemoryRuntime::new().with_image("nginx"));
        runtime.set_behavior("nginx", Behavior::Hang).await;
        let cluster = Cluster::new();
        cluster
            .add_host(Host::new(HostInfo::new("h1", "mem://h1", 2.0, 2048.0), runtime))
            .await
            .unwrap();
        cluster.register_scheduler("service", Policy::Label).await;

        let engine = Engine::new(
            EngineConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(EventBus::new()),
        );
        AppState {
            cluster: Arc::new(cluster),
            engine,
        }
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn run_and_destroy_container() {
        let state = test_state().await;

        let resp = run_container(
            State(state.clone()),
            Query(RunParams::default()),
            Json(JobSpec::new("nginx")),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        let container: RunningContainer = serde_json::from_value(body["data"].clone()).unwrap();
        assert_eq!(container.host_id, "h1");
        assert_eq!(container.state, ContainerState::Running);

        let resp = destroy_container(State(state.clone()), Json(container))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.cluster.list_containers(true).await.is_empty());
    }

    #[tokio::test]
    async fn run_without_scheduler_is_bad_request() {
        let state = test_state().await;
        let resp = run_container(
            State(state),
            Query(RunParams::default()),
            Json(JobSpec::new("nginx").with_type("batch")),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("batch"));
    }

    #[tokio::test]
    async fn run_beyond_capacity_is_bad_request() {
        let state = test_state().await;
        let resp = run_container(
            State(state),
            Query(RunParams::default()),
            Json(JobSpec::new("nginx").with_resources(8.0, 512.0)),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn destroy_on_unknown_host_is_not_found() {
        let state = test_state().await;
        let container = RunningContainer {
            id: "abc".to_string(),
            name: "gone".to_string(),
            host_id: "nowhere".to_string(),
            state: ContainerState::Running,
            ports: Vec::new(),
            job: JobSpec::new("nginx"),
        };
        let resp = destroy_container(State(state), Json(container))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_engines_reports_hosts() {
        let state = test_state().await;
        let body = body_json(list_engines(State(state)).await.into_response()).await;
        assert_eq!(body["data"][0]["id"], "h1");
        assert_eq!(body["data"][0]["state"], "connected");
    }

    #[tokio::test]
    async fn submit_without_build_hosts_is_unavailable() {
        let state = test_state().await;
        let task = BuildTask::new(dockyard_core::Build::new(1, 1), Vec::new());
        let resp = submit_build(State(state), Json(task)).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let state = test_state().await;
        let resp = cancel_job(State(state), Path((1, 1))).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
