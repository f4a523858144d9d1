//! Container-runtime REST wire types.
//!
//! Field names follow the runtime's PascalCase JSON. Only the fields the
//! orchestrator reads or writes are modelled; unknown fields are ignored.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use dockyard_core::{ContainerState, JobSpec, PortBinding, RestartPolicy, RunningContainer};

// ── Labels ────────────────────────────────────────────────────────

pub const LABEL_TYPE: &str = "dockyard.type";
pub const LABEL_CPUS: &str = "dockyard.cpus";
pub const LABEL_MEMORY: &str = "dockyard.memory";
pub const LABEL_LABELS: &str = "dockyard.labels";

const MB: f64 = 1024.0 * 1024.0;

// ── Responses ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Version {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub image: String,
    /// `running`, `exited`, `created`, ...
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub ports: Vec<PortSummary>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PortSummary {
    #[serde(rename = "IP", default)]
    pub ip: String,
    #[serde(rename = "PrivatePort")]
    pub private_port: u16,
    #[serde(rename = "PublicPort", default)]
    pub public_port: Option<u16>,
    #[serde(rename = "Type", default)]
    pub proto: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: InspectState,
    #[serde(default)]
    pub config: InspectConfig,
    #[serde(default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct InspectState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    /// `"80/tcp"` → host bindings.
    #[serde(default)]
    pub ports: HashMap<String, Option<Vec<HostPort>>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct HostPort {
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub host_port: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CreateResponse {
    pub id: String,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorMessage {
    #[serde(default)]
    pub message: String,
}

/// One line of the image pull progress stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A container lifecycle event from the runtime event stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeEvent {
    /// `create`, `start`, `die`, `destroy`, ...
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub time: u64,
}

// ── Requests ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmptyObject {}

/// Body of `POST /containers/create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainer {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub exposed_ports: HashMap<String, EmptyObject>,
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(default)]
    pub cpu_shares: i64,
    /// Bytes.
    #[serde(default)]
    pub memory: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub port_bindings: HashMap<String, Vec<HostPort>>,
    #[serde(default)]
    pub restart_policy: WireRestartPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub publish_all_ports: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct WireRestartPolicy {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub maximum_retry_count: u32,
}

impl From<&RestartPolicy> for WireRestartPolicy {
    fn from(p: &RestartPolicy) -> Self {
        Self {
            name: p.name.clone(),
            maximum_retry_count: p.maximum_retry_count,
        }
    }
}

// ── JobSpec conversion ────────────────────────────────────────────

impl CreateContainer {
    /// Translate a job template into a create request for a host with
    /// `host_cpus` declared CPUs.
    ///
    /// CPU share is `cpus / host_cpus * 100`; memory is sent in bytes.
    pub fn from_job(job: &JobSpec, host_cpus: f64) -> Self {
        let cpu_shares = if host_cpus > 0.0 {
            (job.cpus / host_cpus * 100.0).round() as i64
        } else {
            0
        };

        let mut labels = HashMap::new();
        labels.insert(LABEL_TYPE.to_string(), job.job_type.clone());
        labels.insert(LABEL_CPUS.to_string(), job.cpus.to_string());
        labels.insert(LABEL_MEMORY.to_string(), job.memory.to_string());
        if !job.labels.is_empty() {
            labels.insert(LABEL_LABELS.to_string(), job.labels.join(","));
        }

        let mut exposed_ports = HashMap::new();
        let mut port_bindings: HashMap<String, Vec<HostPort>> = HashMap::new();
        for b in &job.bind_ports {
            let key = format!("{}/{}", b.container_port, b.proto);
            exposed_ports.insert(key.clone(), EmptyObject {});
            port_bindings.entry(key).or_default().push(HostPort {
                host_ip: b.host_ip.clone(),
                host_port: b.port.to_string(),
            });
        }

        Self {
            image: job.name.clone(),
            entrypoint: job.entrypoint.clone(),
            cmd: job.args.clone(),
            env: job
                .environment
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
            labels,
            exposed_ports,
            host_config: HostConfig {
                cpu_shares,
                memory: (job.memory * MB) as i64,
                binds: job.volumes.clone(),
                port_bindings,
                restart_policy: (&job.restart_policy).into(),
                network_mode: job.network_mode.clone(),
                privileged: job.privileged,
                publish_all_ports: job.publish,
            },
        }
    }
}

/// Rebuild the job template of a listed container from its labels.
///
/// Containers not created by the cluster carry no labels and come back as
/// a zero-resource job of the default type.
pub fn job_from_labels(image: &str, labels: &HashMap<String, String>) -> JobSpec {
    let mut job = JobSpec::new(image);
    if let Some(t) = labels.get(LABEL_TYPE) {
        job.job_type = t.clone();
    }
    job.cpus = labels
        .get(LABEL_CPUS)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    job.memory = labels
        .get(LABEL_MEMORY)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    if let Some(l) = labels.get(LABEL_LABELS) {
        job.labels = l
            .split(',')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    job
}

impl ContainerSummary {
    /// Primary name without the runtime's leading slash.
    pub fn name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    /// Convert to the cluster's container view for `host_id`.
    pub fn to_running(&self, host_id: &str) -> RunningContainer {
        let ports = self
            .ports
            .iter()
            .filter_map(|p| {
                p.public_port.map(|public| PortBinding {
                    proto: if p.proto.is_empty() {
                        "tcp".to_string()
                    } else {
                        p.proto.clone()
                    },
                    host_ip: p.ip.clone(),
                    port: public,
                    container_port: p.private_port,
                })
            })
            .collect();

        let mut job = job_from_labels(&self.image, &self.labels);
        let name = self.name().to_string();
        if !name.is_empty() {
            job.container_name = Some(name.clone());
        }

        RunningContainer {
            id: self.id.clone(),
            name,
            host_id: host_id.to_string(),
            state: if self.is_running() {
                ContainerState::Running
            } else {
                ContainerState::Stopped
            },
            ports,
            job,
        }
    }
}

impl ContainerInspect {
    /// Resolved host port bindings, sorted by host port.
    pub fn port_bindings(&self) -> Vec<PortBinding> {
        let mut out: Vec<PortBinding> = self
            .network_settings
            .ports
            .iter()
            .flat_map(|(key, bindings)| {
                let (port, proto) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
                let container_port = port.parse().unwrap_or(0);
                bindings.iter().flatten().filter_map(move |hp| {
                    Some(PortBinding {
                        proto: proto.to_string(),
                        host_ip: hp.host_ip.clone(),
                        port: hp.host_port.parse().ok()?,
                        container_port,
                    })
                })
            })
            .collect();
        out.sort_by_key(|b| (b.port, b.container_port));
        out
    }
}

/// Flatten image tags to a sorted, de-duplicated list.
pub fn repo_tags(images: &[ImageSummary]) -> Vec<String> {
    let tags: BTreeSet<String> = images
        .iter()
        .flat_map(|i| i.repo_tags.iter().flatten())
        .filter(|t| t.as_str() != "<none>:<none>")
        .cloned()
        .collect();
    tags.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_scales_resources() {
        let job = JobSpec::new("redis:6")
            .with_resources(1.0, 256.0)
            .with_port(PortBinding::tcp(6379, 6379));
        let req = CreateContainer::from_job(&job, 4.0);

        assert_eq!(req.host_config.cpu_shares, 25);
        assert_eq!(req.host_config.memory, 256 * 1024 * 1024);
        assert!(req.exposed_ports.contains_key("6379/tcp"));
        assert_eq!(req.host_config.port_bindings["6379/tcp"][0].host_port, "6379");
        assert_eq!(req.labels[LABEL_TYPE], "service");
    }

    #[test]
    fn create_request_serializes_pascal_case() {
        let req = CreateContainer::from_job(&JobSpec::new("alpine"), 2.0);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["Image"], "alpine");
        assert_eq!(json["HostConfig"]["RestartPolicy"]["Name"], "no");
        assert!(json.get("Cmd").is_none());
    }

    #[test]
    fn summary_reconstructs_job_from_labels() {
        let job = JobSpec::new("nginx")
            .with_resources(0.5, 128.0)
            .with_type("batch")
            .with_labels(["ssd", "eu"]);
        let req = CreateContainer::from_job(&job, 2.0);

        let summary = ContainerSummary {
            id: "abc".into(),
            names: vec!["/web".into()],
            image: "nginx".into(),
            state: "running".into(),
            ports: vec![PortSummary {
                ip: "0.0.0.0".into(),
                private_port: 80,
                public_port: Some(8080),
                proto: "tcp".into(),
            }],
            labels: req.labels,
            ..Default::default()
        };
        let running = summary.to_running("h1");

        assert_eq!(running.name, "web");
        assert_eq!(running.host_id, "h1");
        assert!(running.is_running());
        assert_eq!(running.job.cpus, 0.5);
        assert_eq!(running.job.memory, 128.0);
        assert_eq!(running.job.job_type, "batch");
        assert_eq!(running.job.labels, vec!["ssd".to_string(), "eu".to_string()]);
        assert_eq!(running.ports[0].port, 8080);
    }

    #[test]
    fn summary_parses_runtime_json() {
        let raw = r#"[{"Id":"c1","Names":["/db"],"Image":"postgres","State":"exited",
            "Ports":[{"PrivatePort":5432,"Type":"tcp"}],"Labels":{}}]"#;
        let list: Vec<ContainerSummary> = serde_json::from_str(raw).unwrap();
        let running = list[0].to_running("h2");
        assert!(!running.is_running());
        assert!(running.ports.is_empty());
        assert_eq!(running.job.cpus, 0.0);
    }

    #[test]
    fn inspect_port_bindings() {
        let raw = r#"{"Id":"c1","State":{"Running":false,"ExitCode":130},
            "NetworkSettings":{"Ports":{"80/tcp":[{"HostIp":"0.0.0.0","HostPort":"8080"}],"443/tcp":null}}}"#;
        let inspect: ContainerInspect = serde_json::from_str(raw).unwrap();
        assert_eq!(inspect.state.exit_code, 130);
        let ports = inspect.port_bindings();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 8080);
        assert_eq!(ports[0].container_port, 80);
    }

    #[test]
    fn repo_tags_skip_dangling() {
        let images = vec![
            ImageSummary {
                id: "1".into(),
                repo_tags: Some(vec!["redis:latest".into(), "redis:6".into()]),
            },
            ImageSummary {
                id: "2".into(),
                repo_tags: Some(vec!["<none>:<none>".into()]),
            },
            ImageSummary {
                id: "3".into(),
                repo_tags: None,
            },
        ];
        assert_eq!(repo_tags(&images), vec!["redis:6", "redis:latest"]);
    }
}
