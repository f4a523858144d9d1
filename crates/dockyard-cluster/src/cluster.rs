//! The cluster: host registry, scheduler registry, and the start pipeline.
//!
//! One mutex guards both registries and the whole of `start`, so
//! placement is serialized cluster-wide. Routing calls (stop, kill,
//! remove, logs) only hold it long enough to look up the host.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dockyard_core::{Event, HostId, HostInfo, HostSnapshot, JobSpec, RunningContainer};
use dockyard_placement::{Admit, Policy, place};
use dockyard_runtime::{ConnectionState, Host, LogOptions, LogStream, RuntimeError};

use crate::error::{ClusterError, ClusterResult};

/// Delay before re-subscribing to a host's event stream.
const EVENT_RETRY: Duration = Duration::from_secs(5);

/// Grace period given to `stop` before the runtime kills. Matches the
/// `[engine] stop_timeout_secs` default.
pub const DEFAULT_STOP_TIMEOUT_SECS: u32 = 30;

/// A log request routed to the container's host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRequest {
    pub host_id: HostId,
    pub container_id: String,
    pub options: LogOptions,
}

impl LogRequest {
    pub fn new(container: &RunningContainer) -> Self {
        Self {
            host_id: container.host_id.clone(),
            container_id: container.id.clone(),
            options: LogOptions::default(),
        }
    }

    pub fn follow(mut self) -> Self {
        self.options.follow = true;
        self
    }

    pub fn tail(mut self, lines: u64) -> Self {
        self.options.tail = Some(lines);
        self
    }

    pub fn stdout_only(mut self) -> Self {
        self.options.stderr = false;
        self
    }
}

/// A registered host as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    #[serde(flatten)]
    pub info: HostInfo,
    pub state: ConnectionState,
}

#[derive(Default)]
struct Registry {
    hosts: BTreeMap<HostId, Arc<Host>>,
    schedulers: HashMap<String, Policy>,
}

pub struct Cluster {
    registry: Mutex<Registry>,
    stop_timeout_secs: u32,
}

impl Default for Cluster {
    fn default() -> Self {
        Self {
            registry: Mutex::default(),
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
        }
    }
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stop_timeout(mut self, secs: u32) -> Self {
        self.stop_timeout_secs = secs;
        self
    }

    // ── Registries ────────────────────────────────────────────────

    pub async fn add_host(&self, host: Host) -> ClusterResult<()> {
        let mut reg = self.registry.lock().await;
        let id = host.id().to_string();
        if reg.hosts.contains_key(&id) {
            return Err(ClusterError::DuplicateHost(id));
        }
        info!(host = %id, addr = %host.info().addr, cpus = host.info().cpus, memory = host.info().memory, "host registered");
        reg.hosts.insert(id, Arc::new(host));
        Ok(())
    }

    /// Register a host for each entry, connecting over HTTP.
    pub async fn connect_hosts(&self, infos: impl IntoIterator<Item = HostInfo>) -> ClusterResult<usize> {
        let mut added = 0;
        for info in infos {
            self.add_host(Host::connect(info)?).await?;
            added += 1;
        }
        Ok(added)
    }

    pub async fn remove_host(&self, id: &str) -> ClusterResult<Arc<Host>> {
        let removed = self.registry.lock().await.hosts.remove(id);
        match removed {
            Some(host) => {
                info!(host = %id, "host deregistered");
                Ok(host)
            }
            None => Err(ClusterError::HostNotFound(id.to_string())),
        }
    }

    /// Use `policy` for jobs whose type is `job_type`.
    pub async fn register_scheduler(&self, job_type: impl Into<String>, policy: Policy) {
        let job_type = job_type.into();
        debug!(%job_type, ?policy, "scheduler registered");
        self.registry
            .lock()
            .await
            .schedulers
            .insert(job_type, policy);
    }

    pub async fn host(&self, id: &str) -> ClusterResult<Arc<Host>> {
        self.registry
            .lock()
            .await
            .hosts
            .get(id)
            .cloned()
            .ok_or_else(|| ClusterError::HostNotFound(id.to_string()))
    }

    /// Every registered host, ordered by id.
    pub async fn hosts(&self) -> Vec<HostStatus> {
        self.registry
            .lock()
            .await
            .hosts
            .values()
            .map(|h| HostStatus {
                info: h.info().clone(),
                state: h.state(),
            })
            .collect()
    }

    // ── Placement ─────────────────────────────────────────────────

    /// Admit, score, and start `job` on the least loaded eligible host.
    pub async fn start(&self, job: &JobSpec, pull: bool) -> ClusterResult<RunningContainer> {
        let reg = self.registry.lock().await;
        let policy = reg
            .schedulers
            .get(&job.job_type)
            .ok_or_else(|| ClusterError::NoScheduler(job.job_type.clone()))?;

        let mut snapshots: Vec<HostSnapshot> = Vec::new();
        for host in reg.hosts.values() {
            match policy.admit(job, host).await {
                Ok(true) => match host.snapshot().await {
                    Ok(snap) => snapshots.push(snap),
                    Err(e) => warn!(host = %host.id(), error = %e, "skipping host: snapshot failed"),
                },
                Ok(false) => {}
                Err(e) => warn!(host = %host.id(), error = %e, "skipping host: admission failed"),
            }
        }
        if snapshots.is_empty() {
            return Err(ClusterError::NoEligibleHosts);
        }

        let chosen = place(job, &snapshots)?;
        let host = reg
            .hosts
            .get(&chosen.host_id)
            .ok_or_else(|| ClusterError::HostNotFound(chosen.host_id.clone()))?;
        let container = host.start(job, pull).await?;
        info!(
            host = %host.id(),
            container = %container.id,
            image = %job.name,
            job_type = %job.job_type,
            "job placed"
        );
        Ok(container)
    }

    // ── Routing ───────────────────────────────────────────────────

    pub async fn stop(&self, container: &RunningContainer) -> ClusterResult<()> {
        let host = self.host(&container.host_id).await?;
        host.stop(&container.id, self.stop_timeout_secs).await?;
        Ok(())
    }

    pub async fn kill(&self, container: &RunningContainer) -> ClusterResult<()> {
        let host = self.host(&container.host_id).await?;
        host.kill(&container.id).await?;
        Ok(())
    }

    pub async fn remove(&self, container: &RunningContainer) -> ClusterResult<()> {
        let host = self.host(&container.host_id).await?;
        host.remove(&container.id).await?;
        Ok(())
    }

    /// Kill (if still running) and remove.
    pub async fn destroy(&self, container: &RunningContainer) -> ClusterResult<()> {
        let host = self.host(&container.host_id).await?;
        match host.kill(&container.id).await {
            Ok(()) | Err(RuntimeError::Conflict(_)) => {}
            Err(e) => return Err(e.into()),
        }
        host.remove(&container.id).await?;
        Ok(())
    }

    pub async fn logs(&self, req: &LogRequest) -> ClusterResult<LogStream> {
        let host = self.host(&req.host_id).await?;
        Ok(host.logs(&req.container_id, &req.options).await?)
    }

    /// Containers across every host. Unreachable hosts are skipped.
    pub async fn list_containers(&self, all: bool) -> Vec<RunningContainer> {
        let hosts: Vec<Arc<Host>> = self.registry.lock().await.hosts.values().cloned().collect();
        let mut out = Vec::new();
        for host in hosts {
            match host.containers(all).await {
                Ok(mut list) => out.append(&mut list),
                Err(e) => warn!(host = %host.id(), error = %e, "skipping host: list failed"),
            }
        }
        out
    }

    // ── Events ────────────────────────────────────────────────────

    /// Republish every registered host's runtime events through `publish`.
    ///
    /// Subscriptions are retried while the host is unreachable. Hosts
    /// added later are not covered; abort the returned tasks to stop.
    pub async fn forward_events<F>(&self, publish: F) -> Vec<JoinHandle<()>>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let publish = Arc::new(publish);
        let hosts: Vec<Arc<Host>> = self.registry.lock().await.hosts.values().cloned().collect();
        hosts
            .into_iter()
            .map(|host| {
                let publish = publish.clone();
                tokio::spawn(async move {
                    loop {
                        match host.events().await {
                            Ok(mut stream) => {
                                debug!(host = %host.id(), "subscribed to runtime events");
                                while let Some(ev) = stream.next().await {
                                    match ev {
                                        Ok(ev) => publish(Event::runtime(ev.status, ev.id, host.id(), ev.time)),
                                        Err(e) => {
                                            warn!(host = %host.id(), error = %e, "runtime event stream failed");
                                            break;
                                        }
                                    }
                                }
                            }
                            Err(e) => warn!(host = %host.id(), error = %e, "cannot subscribe to runtime events"),
                        }
                        tokio::time::sleep(EVENT_RETRY).await;
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_core::PortBinding;
    use dockyard_runtime::{Behavior, MemoryRuntime};

    async fn make_cluster(hosts: &[(&str, f64, f64)]) -> (Cluster, Vec<Arc<MemoryRuntime>>) {
        let cluster = Cluster::new();
        let mut runtimes = Vec::new();
        for (id, cpus, memory) in hosts {
            let rt = Arc::new(MemoryRuntime::new().with_image("nginx").with_image("redis"));
            rt.set_behavior("nginx", Behavior::Hang).await;
            rt.set_behavior("redis", Behavior::Hang).await;
            let info = HostInfo::new(*id, format!("mem://{id}"), *cpus, *memory);
            cluster.add_host(Host::new(info, rt.clone())).await.unwrap();
            runtimes.push(rt);
        }
        (cluster, runtimes)
    }

    #[tokio::test]
    async fn start_without_scheduler_fails_before_touching_hosts() {
        let (cluster, runtimes) = make_cluster(&[("h1", 4.0, 4096.0)]).await;
        runtimes[0].set_unreachable(true).await;

        let err = cluster.start(&JobSpec::new("nginx").with_type("batch"), false).await.unwrap_err();
        assert!(matches!(err, ClusterError::NoScheduler(t) if t == "batch"));
        assert!(runtimes[0].calls().await.is_empty());
    }

    #[tokio::test]
    async fn start_places_on_least_loaded_host() {
        let (cluster, runtimes) = make_cluster(&[("h1", 4.0, 4096.0), ("h2", 4.0, 4096.0)]).await;
        cluster.register_scheduler("service", Policy::Label).await;

        let job = JobSpec::new("nginx").with_resources(2.0, 2048.0);
        let first = cluster.start(&job, false).await.unwrap();
        let second = cluster.start(&job, false).await.unwrap();

        assert_eq!(first.host_id, "h1");
        assert_eq!(second.host_id, "h2");
        assert_eq!(runtimes[0].container_count().await, 1);
        assert_eq!(runtimes[1].container_count().await, 1);

        let err = cluster.start(&job.clone().with_resources(3.0, 3072.0), false).await.unwrap_err();
        assert!(matches!(err, ClusterError::Placement(_)));
    }

    #[tokio::test]
    async fn no_admitted_hosts() {
        let (cluster, _) = make_cluster(&[("h1", 4.0, 4096.0)]).await;
        cluster.register_scheduler("service", Policy::Label).await;
        let err = cluster
            .start(&JobSpec::new("nginx").with_labels(["gpu"]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoEligibleHosts));
    }

    #[tokio::test]
    async fn unreachable_host_is_skipped() {
        let (cluster, runtimes) = make_cluster(&[("h1", 4.0, 4096.0), ("h2", 4.0, 4096.0)]).await;
        cluster
            .register_scheduler("service", Policy::from_names(&["label", "port"]).unwrap())
            .await;
        runtimes[0].set_unreachable(true).await;

        let job = JobSpec::new("nginx").with_port(PortBinding::tcp(8080, 80));
        let c = cluster.start(&job, false).await.unwrap();
        assert_eq!(c.host_id, "h2");

        let hosts = cluster.hosts().await;
        assert_eq!(hosts[0].state, ConnectionState::Unreachable);
        assert_eq!(hosts[1].state, ConnectionState::Connected);

        // the port is now taken on the only reachable host
        let err = cluster.start(&job, false).await.unwrap_err();
        assert!(matches!(err, ClusterError::NoEligibleHosts));
    }

    #[tokio::test]
    async fn routing_fails_for_deregistered_host() {
        let (cluster, _) = make_cluster(&[("h1", 4.0, 4096.0)]).await;
        cluster.register_scheduler("service", Policy::Label).await;
        let c = cluster.start(&JobSpec::new("redis"), false).await.unwrap();

        cluster.remove_host("h1").await.unwrap();
        assert!(matches!(cluster.stop(&c).await, Err(ClusterError::HostNotFound(id)) if id == "h1"));
        assert!(matches!(
            cluster.logs(&LogRequest::new(&c)).await,
            Err(ClusterError::HostNotFound(_))
        ));
    }

    #[tokio::test]
    async fn stop_uses_configured_grace_period() {
        let (cluster, runtimes) = make_cluster(&[("h1", 4.0, 4096.0)]).await;
        let cluster = cluster.with_stop_timeout(7);
        cluster.register_scheduler("service", Policy::Label).await;
        let c = cluster.start(&JobSpec::new("redis").with_container_name("cache"), false).await.unwrap();

        cluster.stop(&c).await.unwrap();
        assert_eq!(runtimes[0].stop_timeouts().await, vec![("cache".to_string(), 7)]);
    }

    #[tokio::test]
    async fn failed_start_leaves_name_free() {
        let (cluster, runtimes) = make_cluster(&[("h1", 4.0, 4096.0)]).await;
        cluster.register_scheduler("service", Policy::UniqueName).await;
        let job = JobSpec::new("redis").with_container_name("cache");

        runtimes[0].fail_starts(1).await;
        assert!(matches!(cluster.start(&job, false).await, Err(ClusterError::Runtime(_))));
        assert!(cluster.list_containers(true).await.is_empty());

        let c = cluster.start(&job, false).await.unwrap();
        assert_eq!(c.name, "cache");
    }

    #[tokio::test]
    async fn destroy_kills_and_removes() {
        let (cluster, runtimes) = make_cluster(&[("h1", 4.0, 4096.0)]).await;
        cluster.register_scheduler("service", Policy::Label).await;
        let c = cluster.start(&JobSpec::new("redis").with_container_name("cache"), false).await.unwrap();

        assert_eq!(cluster.list_containers(false).await.len(), 1);
        cluster.destroy(&c).await.unwrap();
        assert!(cluster.list_containers(true).await.is_empty());

        let calls = runtimes[0].calls().await;
        assert!(calls.contains(&"kill cache".to_string()));
        assert!(calls.contains(&"remove cache".to_string()));
    }

    #[tokio::test]
    async fn listed_containers_carry_job_resources() {
        let (cluster, _) = make_cluster(&[("h1", 4.0, 4096.0)]).await;
        cluster.register_scheduler("service", Policy::Label).await;
        cluster
            .start(&JobSpec::new("redis").with_resources(1.5, 300.0), false)
            .await
            .unwrap();

        let listed = cluster.list_containers(false).await;
        assert_eq!(listed[0].job.cpus, 1.5);
        assert_eq!(listed[0].job.memory, 300.0);
        assert_eq!(listed[0].host_id, "h1");
    }

    #[tokio::test]
    async fn duplicate_host_is_rejected() {
        let (cluster, _) = make_cluster(&[("h1", 4.0, 4096.0)]).await;
        let again = Host::new(HostInfo::new("h1", "mem://h1", 1.0, 1.0), Arc::new(MemoryRuntime::new()));
        assert!(matches!(cluster.add_host(again).await, Err(ClusterError::DuplicateHost(_))));
    }

    #[tokio::test]
    async fn runtime_events_are_forwarded() {
        let (cluster, _) = make_cluster(&[("h1", 4.0, 4096.0)]).await;
        cluster.register_scheduler("service", Policy::Label).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let tasks = cluster.forward_events(move |ev| {
            let _ = tx.send(ev);
        })
        .await;
        // let the forwarder subscribe
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let c = cluster.start(&JobSpec::new("redis"), false).await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.name, "create");
        assert_eq!(ev.container.as_deref(), Some(c.id.as_str()));
        assert_eq!(ev.host.as_deref(), Some("h1"));

        for t in tasks {
            t.abort();
        }
    }
}
