//! Domain types shared by the cluster, the placement engine, and the API.
//!
//! All types serialize to/from JSON; `JobSpec` and `RunningContainer` are
//! the request and response bodies of the HTTP control surface.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of a host in the cluster registry.
pub type HostId = String;

/// Scheduler type used when a job does not name one.
pub const DEFAULT_JOB_TYPE: &str = "service";

// ── Job template ──────────────────────────────────────────────────

/// Immutable template describing one unit of work to run in a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    /// Runtime image reference (`name[:tag]`).
    pub name: String,
    /// Fixed container name, if the job requires one.
    #[serde(default)]
    pub container_name: Option<String>,
    /// Requested CPUs (fractional).
    #[serde(default)]
    pub cpus: f64,
    /// Requested memory in MB.
    #[serde(default)]
    pub memory: f64,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Bind mounts in `host:container[:mode]` form.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub bind_ports: Vec<PortBinding>,
    /// Constraint labels. `host:<id>` entries pin the job to a host.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Selects the admission scheduler.
    #[serde(rename = "type", default = "default_job_type")]
    pub job_type: String,
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    /// Publish all exposed ports on random host ports.
    #[serde(default)]
    pub publish: bool,
}

fn default_job_type() -> String {
    DEFAULT_JOB_TYPE.to_string()
}

impl JobSpec {
    /// A job for `image` with no resource request and default type.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            name: image.into(),
            container_name: None,
            cpus: 0.0,
            memory: 0.0,
            entrypoint: Vec::new(),
            args: Vec::new(),
            environment: BTreeMap::new(),
            volumes: Vec::new(),
            bind_ports: Vec::new(),
            labels: Vec::new(),
            restart_policy: RestartPolicy::default(),
            job_type: default_job_type(),
            network_mode: None,
            privileged: false,
            publish: false,
        }
    }

    pub fn with_resources(mut self, cpus: f64, memory: f64) -> Self {
        self.cpus = cpus;
        self.memory = memory;
        self
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = job_type.into();
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_container_name(mut self, name: impl Into<String>) -> Self {
        self.container_name = Some(name.into());
        self
    }

    pub fn with_port(mut self, binding: PortBinding) -> Self {
        self.bind_ports.push(binding);
        self
    }
}

/// A host port bound to a container port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PortBinding {
    #[serde(default = "default_proto")]
    pub proto: String,
    /// Host interface; empty means all interfaces.
    #[serde(default)]
    pub host_ip: String,
    /// Host port.
    pub port: u16,
    pub container_port: u16,
}

fn default_proto() -> String {
    "tcp".to_string()
}

impl PortBinding {
    pub fn tcp(port: u16, container_port: u16) -> Self {
        Self {
            proto: default_proto(),
            host_ip: String::new(),
            port,
            container_port,
        }
    }

    /// Host IP with the empty string folded into the wildcard address.
    pub fn effective_host_ip(&self) -> &str {
        if self.host_ip.is_empty() {
            "0.0.0.0"
        } else {
            &self.host_ip
        }
    }

    /// Two bindings collide when they claim the same host port and
    /// protocol on the same (effective) interface.
    pub fn collides_with(&self, other: &PortBinding) -> bool {
        self.port == other.port
            && self.proto.eq_ignore_ascii_case(&other.proto)
            && self.effective_host_ip() == other.effective_host_ip()
    }
}

/// Container restart policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartPolicy {
    /// `no`, `always`, `unless-stopped`, or `on-failure`.
    pub name: String,
    #[serde(default)]
    pub maximum_retry_count: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            name: "no".to_string(),
            maximum_retry_count: 0,
        }
    }
}

// ── Containers ────────────────────────────────────────────────────

/// Lifecycle state of a placed container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Running,
    Stopped,
}

/// A container placed on a host.
///
/// `host_id` is a lookup key into the cluster registry, not ownership:
/// the host may be deregistered while the record is still held.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunningContainer {
    pub id: String,
    pub name: String,
    pub host_id: HostId,
    pub state: ContainerState,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    /// The template the container was created from.
    pub job: JobSpec,
}

impl RunningContainer {
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}

// ── Hosts ─────────────────────────────────────────────────────────

/// Declared identity and capacity of a container-runtime host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostInfo {
    pub id: HostId,
    /// Runtime endpoint: `unix:///path`, `tcp://host:port`, or `http://host:port`.
    pub addr: String,
    pub cpus: f64,
    /// Memory in MB.
    pub memory: f64,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl HostInfo {
    pub fn new(id: impl Into<String>, addr: impl Into<String>, cpus: f64, memory: f64) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            cpus,
            memory,
            labels: Vec::new(),
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }
}

/// Point-in-time utilization of one host, used only for scoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostSnapshot {
    pub host_id: HostId,
    pub cpus: f64,
    pub memory: f64,
    pub reserved_cpus: f64,
    pub reserved_memory: f64,
}

impl HostSnapshot {
    /// Snapshot of `host` with the given jobs counted as reserved.
    pub fn from_jobs<'a>(host: &HostInfo, jobs: impl IntoIterator<Item = &'a JobSpec>) -> Self {
        let (reserved_cpus, reserved_memory) = jobs
            .into_iter()
            .fold((0.0, 0.0), |(c, m), j| (c + j.cpus, m + j.memory));
        Self {
            host_id: host.id.clone(),
            cpus: host.cpus,
            memory: host.memory,
            reserved_cpus,
            reserved_memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_spec_defaults_from_minimal_json() {
        let spec: JobSpec = serde_json::from_str(r#"{"name":"redis"}"#).unwrap();
        assert_eq!(spec.job_type, DEFAULT_JOB_TYPE);
        assert_eq!(spec.restart_policy.name, "no");
        assert!(spec.labels.is_empty());
        assert_eq!(spec.cpus, 0.0);
    }

    #[test]
    fn job_type_uses_type_key() {
        let spec: JobSpec = serde_json::from_str(r#"{"name":"redis","type":"batch"}"#).unwrap();
        assert_eq!(spec.job_type, "batch");

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "batch");
    }

    #[test]
    fn empty_host_ip_collides_with_wildcard() {
        let a = PortBinding::tcp(8080, 80);
        let mut b = PortBinding::tcp(8080, 8080);
        b.host_ip = "0.0.0.0".to_string();
        assert!(a.collides_with(&b));

        b.host_ip = "10.0.0.1".to_string();
        assert!(!a.collides_with(&b));
    }

    #[test]
    fn different_protocols_do_not_collide() {
        let a = PortBinding::tcp(53, 53);
        let mut b = PortBinding::tcp(53, 53);
        b.proto = "udp".to_string();
        assert!(!a.collides_with(&b));
    }

    #[test]
    fn snapshot_sums_reserved_resources() {
        let host = HostInfo::new("h1", "tcp://10.0.0.1:2375", 4.0, 4096.0);
        let jobs = [
            JobSpec::new("a").with_resources(1.0, 512.0),
            JobSpec::new("b").with_resources(0.5, 256.0),
        ];
        let snap = HostSnapshot::from_jobs(&host, jobs.iter());
        assert_eq!(snap.reserved_cpus, 1.5);
        assert_eq!(snap.reserved_memory, 768.0);
        assert_eq!(snap.cpus, 4.0);
    }
}
