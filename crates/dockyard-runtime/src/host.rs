//! A container-runtime host: declared identity and capacity plus the
//! connection handle used to drive it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use dockyard_core::{ContainerState, HostInfo, HostSnapshot, ImageName, JobSpec, RunningContainer};

use crate::client::HttpRuntime;
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{ContainerRuntime, LogOptions};
use crate::stream::{EventStream, LogStream};
use crate::wire::{ContainerInspect, CreateContainer};

/// Connection state as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Unreachable,
}

pub struct Host {
    info: HostInfo,
    runtime: Arc<dyn ContainerRuntime>,
    reachable: AtomicBool,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("info", &self.info)
            .field("state", &self.state())
            .finish()
    }
}

impl Host {
    pub fn new(info: HostInfo, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            info,
            runtime,
            reachable: AtomicBool::new(true),
        }
    }

    /// Host backed by the HTTP runtime at `info.addr`.
    pub fn connect(info: HostInfo) -> RuntimeResult<Self> {
        let runtime = HttpRuntime::from_addr(&info.addr)?;
        Ok(Self::new(info, Arc::new(runtime)))
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &HostInfo {
        &self.info
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn state(&self) -> ConnectionState {
        if self.reachable.load(Ordering::Relaxed) {
            ConnectionState::Connected
        } else {
            ConnectionState::Unreachable
        }
    }

    /// Record reachability from the outcome of a runtime call.
    fn track<T>(&self, result: RuntimeResult<T>) -> RuntimeResult<T> {
        match &result {
            Ok(_) => {
                if !self.reachable.swap(true, Ordering::Relaxed) {
                    info!(host = %self.info.id, "host reachable again");
                }
            }
            Err(e) if e.is_unreachable() => {
                if self.reachable.swap(false, Ordering::Relaxed) {
                    warn!(host = %self.info.id, error = %e, "host unreachable");
                }
            }
            Err(_) => {}
        }
        result
    }

    /// Containers on this host; stopped ones too when `all` is set.
    pub async fn containers(&self, all: bool) -> RuntimeResult<Vec<RunningContainer>> {
        let list = self.track(self.runtime.list_containers(all).await)?;
        Ok(list.iter().map(|c| c.to_running(&self.info.id)).collect())
    }

    /// Normalized references of every image in the local cache.
    pub async fn images(&self) -> RuntimeResult<Vec<ImageName>> {
        let images = self.track(self.runtime.list_images().await)?;
        Ok(crate::wire::repo_tags(&images)
            .iter()
            .map(|t| ImageName::parse(t))
            .collect())
    }

    /// Current utilization: declared capacity plus the resources of every
    /// running container.
    pub async fn snapshot(&self) -> RuntimeResult<HostSnapshot> {
        let running = self.containers(false).await?;
        Ok(HostSnapshot::from_jobs(
            &self.info,
            running.iter().map(|c| &c.job),
        ))
    }

    /// Create and start a container for `job`.
    ///
    /// With `pull` the image is pulled first. Otherwise a missing image is
    /// pulled and the create retried once.
    pub async fn start(&self, job: &JobSpec, pull: bool) -> RuntimeResult<RunningContainer> {
        let config = CreateContainer::from_job(job, self.info.cpus);
        let name = job.container_name.as_deref();

        if pull {
            self.track(self.runtime.pull_image(&job.name).await)?;
        }

        let id = match self.track(self.runtime.create_container(name, &config).await) {
            Ok(id) => id,
            Err(RuntimeError::NoSuchImage(_)) if !pull => {
                debug!(host = %self.info.id, image = %job.name, "image missing, pulling");
                self.track(self.runtime.pull_image(&job.name).await)?;
                self.track(self.runtime.create_container(name, &config).await)?
            }
            Err(e) => return Err(e),
        };

        let inspect = match self.launch(&id).await {
            Ok(inspect) => inspect,
            Err(e) => {
                if let Err(re) = self.runtime.remove_container(&id, true, true).await {
                    warn!(host = %self.info.id, container = %id, error = %re, "cannot remove container after failed start");
                }
                return Err(e);
            }
        };
        info!(host = %self.info.id, container = %id, image = %job.name, "container started");

        Ok(RunningContainer {
            id,
            name: inspect.name.trim_start_matches('/').to_string(),
            host_id: self.info.id.clone(),
            state: if inspect.state.running {
                ContainerState::Running
            } else {
                ContainerState::Stopped
            },
            ports: inspect.port_bindings(),
            job: job.clone(),
        })
    }

    async fn launch(&self, id: &str) -> RuntimeResult<ContainerInspect> {
        self.track(self.runtime.start_container(id).await)?;
        self.track(self.runtime.inspect_container(id).await)
    }

    pub async fn inspect(&self, id: &str) -> RuntimeResult<ContainerInspect> {
        self.track(self.runtime.inspect_container(id).await)
    }

    /// Runtime version string, also a reachability check.
    pub async fn version(&self) -> RuntimeResult<String> {
        Ok(self.track(self.runtime.version().await)?.version)
    }

    pub async fn stop(&self, id: &str, timeout_secs: u32) -> RuntimeResult<()> {
        self.track(self.runtime.stop_container(id, timeout_secs).await)
    }

    pub async fn kill(&self, id: &str) -> RuntimeResult<()> {
        self.track(self.runtime.kill_container(id, None).await)
    }

    /// Force-remove a container and its anonymous volumes.
    pub async fn remove(&self, id: &str) -> RuntimeResult<()> {
        self.track(self.runtime.remove_container(id, true, true).await)?;
        info!(host = %self.info.id, container = %id, "container removed");
        Ok(())
    }

    pub async fn logs(&self, id: &str, opts: &LogOptions) -> RuntimeResult<LogStream> {
        self.track(self.runtime.container_logs(id, opts).await)
    }

    pub async fn events(&self) -> RuntimeResult<EventStream> {
        self.track(self.runtime.events().await)
    }
}
