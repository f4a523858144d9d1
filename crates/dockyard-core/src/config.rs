//! dockyard.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::types::HostInfo;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockyardConfig {
    pub server: ServerConfig,
    pub discovery: DiscoveryConfig,
    pub engine: EngineConfig,
    /// Static job-target hosts.
    pub hosts: Vec<HostInfo>,
    /// Build-agent hosts seeded into the host pool.
    pub workers: Vec<HostInfo>,
    /// Job type → admission policy names.
    pub schedulers: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Environment variable prefix, e.g. `DOCKER_HOST` for `DOCKER_HOST_0`.
    pub prefix: String,
    /// Address of the single host registered when discovery finds none.
    pub default_addr: String,
    pub default_cpus: f64,
    /// MB.
    pub default_memory: f64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            prefix: "DOCKER_HOST_".to_string(),
            default_addr: "unix:///var/run/docker.sock".to_string(),
            default_cpus: std::thread::available_parallelism()
                .map(|n| n.get() as f64)
                .unwrap_or(1.0),
            default_memory: 2048.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub agent_image: String,
    pub entrypoint: Vec<String>,
    pub build_args: Vec<String>,
    pub pull_request_args: Vec<String>,
    pub notify_args: Vec<String>,
    pub timeout_secs: u64,
    /// Runtime control socket mounted into agent containers.
    pub socket_path: String,
    pub log_limit_bytes: usize,
    pub notify_log_limit_bytes: usize,
    pub stop_timeout_secs: u32,
    /// Extra `KEY=value` entries for every agent container.
    pub env: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_image: "drone/drone-exec:latest".to_string(),
            entrypoint: vec!["/bin/drone-exec".to_string()],
            build_args: vec![
                "--pull".to_string(),
                "--cache".to_string(),
                "--clone".to_string(),
                "--build".to_string(),
                "--deploy".to_string(),
            ],
            pull_request_args: vec![
                "--pull".to_string(),
                "--cache".to_string(),
                "--clone".to_string(),
                "--build".to_string(),
            ],
            notify_args: vec!["--pull".to_string(), "--notify".to_string()],
            timeout_secs: 3600,
            socket_path: "/var/run/docker.sock".to_string(),
            log_limit_bytes: 5_000_000,
            notify_log_limit_bytes: 50_000,
            stop_timeout_secs: 30,
            env: Vec::new(),
        }
    }
}

/// Proxy variables forwarded from the daemon into build containers.
pub const PROXY_VARS: [&str; 6] = [
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "NO_PROXY",
    "no_proxy",
];

impl EngineConfig {
    /// Append any proxy variables present in `vars` to `env`.
    pub fn with_proxy_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (k, v) in vars {
            let (k, v) = (k.as_ref(), v.as_ref());
            if PROXY_VARS.contains(&k) && !v.is_empty() {
                self.env.push(format!("{k}={v}"));
            }
        }
        self
    }
}

impl DockyardConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: DockyardConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given and present, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) if p.exists() => Self::from_file(p),
            Some(p) => {
                tracing::warn!(path = %p.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.timeout_secs == 0 {
            return Err(ConfigError::Invalid("engine.timeout_secs must be > 0".into()));
        }
        for host in self.hosts.iter().chain(&self.workers) {
            if host.id.is_empty() || host.addr.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "host entries need an id and addr (got id={:?})",
                    host.id
                )));
            }
            if host.cpus <= 0.0 || host.memory <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "host {} must declare positive cpus and memory",
                    host.id
                )));
            }
        }
        Ok(())
    }
}
