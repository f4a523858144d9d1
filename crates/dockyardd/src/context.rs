//! Daemon wiring.
//!
//! Everything the daemon runs is assembled here into one [`Context`] and
//! passed explicitly; there is no global state.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use axum::Router;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use dockyard_api::{AppState, build_router};
use dockyard_cluster::Cluster;
use dockyard_core::{DockyardConfig, HostInfo, discover_hosts};
use dockyard_engine::{BuildStore, Engine, EventBus};
use dockyard_placement::Policy;
use dockyard_runtime::Host;

use crate::store::TracingStore;

/// Admission policies used when the configuration names none.
pub fn default_schedulers() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([
        (
            "service".to_string(),
            vec!["label".to_string(), "unique-name".to_string(), "port".to_string()],
        ),
        ("batch".to_string(), vec!["label".to_string()]),
    ])
}

/// Job-target hosts and build workers the daemon will use.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedHosts {
    pub hosts: Vec<HostInfo>,
    pub workers: Vec<HostInfo>,
}

/// Static hosts win over environment discovery; workers default to the
/// job-target hosts.
pub fn resolve_hosts(config: &DockyardConfig, vars: &[(String, String)]) -> ResolvedHosts {
    let hosts = if config.hosts.is_empty() {
        discover_hosts(
            &config.discovery,
            vars.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )
    } else {
        config.hosts.clone()
    };
    let workers = if config.workers.is_empty() {
        hosts.clone()
    } else {
        config.workers.clone()
    };
    ResolvedHosts { hosts, workers }
}

pub struct Context {
    pub config: DockyardConfig,
    pub cluster: Arc<Cluster>,
    pub engine: Engine,
}

impl Context {
    /// Build a context against real runtime hosts. `vars` is the process
    /// environment, used for host discovery and proxy forwarding.
    pub async fn connect(mut config: DockyardConfig, vars: Vec<(String, String)>) -> anyhow::Result<Self> {
        let resolved = resolve_hosts(&config, &vars);
        let hosts = connect_all(resolved.hosts)?;
        let workers = connect_all(resolved.workers)?;
        config.engine = config.engine.clone().with_proxy_env(vars);
        Self::assemble(config, Arc::new(TracingStore), hosts, workers).await
    }

    /// Build a context from already constructed hosts.
    pub async fn assemble(
        config: DockyardConfig,
        store: Arc<dyn BuildStore>,
        hosts: Vec<Host>,
        workers: Vec<Host>,
    ) -> anyhow::Result<Self> {
        let cluster = Cluster::new().with_stop_timeout(config.engine.stop_timeout_secs);
        for host in hosts {
            cluster.add_host(host).await?;
        }

        let schedulers = if config.schedulers.is_empty() {
            default_schedulers()
        } else {
            config.schedulers.clone()
        };
        for (job_type, names) in &schedulers {
            let policy = Policy::from_names(names)
                .map_err(|name| anyhow!("unknown admission policy {name:?} for job type {job_type:?}"))?;
            cluster.register_scheduler(job_type.clone(), policy).await;
        }

        let engine = Engine::new(config.engine.clone(), store, Arc::new(EventBus::new()));
        for worker in workers {
            let id = worker.id().to_string();
            match engine.allocate(worker).await {
                Ok(true) => {}
                Ok(false) => warn!(host = %id, "duplicate build host ignored"),
                // already logged by the engine; the daemon runs without it
                Err(_) => warn!(host = %id, "build host skipped"),
            }
        }

        info!(
            hosts = cluster.hosts().await.len(),
            workers = engine.pool().len().await,
            schedulers = schedulers.len(),
            "context assembled"
        );
        Ok(Self {
            config,
            cluster: Arc::new(cluster),
            engine,
        })
    }

    pub fn router(&self) -> Router {
        build_router(AppState {
            cluster: self.cluster.clone(),
            engine: self.engine.clone(),
        })
    }

    /// Republish runtime events of every registered host on the bus.
    pub async fn forward_events(&self) -> Vec<JoinHandle<()>> {
        let bus = self.engine.bus().clone();
        self.cluster
            .forward_events(move |ev| {
                bus.publish(ev);
            })
            .await
    }
}

fn connect_all(infos: Vec<HostInfo>) -> anyhow::Result<Vec<Host>> {
    infos
        .into_iter()
        .map(|info| {
            let id = info.id.clone();
            Host::connect(info).with_context(|| format!("host {id}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn default_policies_parse() {
        for names in default_schedulers().values() {
            assert!(Policy::from_names(names).is_ok());
        }
    }

    #[test]
    fn discovered_hosts_double_as_workers() {
        let config = DockyardConfig::default();
        let resolved = resolve_hosts(
            &config,
            &vars(&[("DOCKER_HOST_0", "tcp://10.0.0.1:2375"), ("DOCKER_HOST_1", "tcp://10.0.0.2:2375")]),
        );
        assert_eq!(resolved.hosts.len(), 2);
        assert_eq!(resolved.workers, resolved.hosts);
    }

    #[test]
    fn static_hosts_skip_discovery() {
        let config = DockyardConfig {
            hosts: vec![HostInfo::new("a", "tcp://a:2375", 4.0, 4096.0)],
            workers: vec![HostInfo::new("w", "tcp://w:2375", 2.0, 2048.0)],
            ..Default::default()
        };
        let resolved = resolve_hosts(&config, &vars(&[("DOCKER_HOST_0", "tcp://10.0.0.1:2375")]));
        assert_eq!(resolved.hosts[0].id, "a");
        assert_eq!(resolved.workers[0].id, "w");
    }
}
