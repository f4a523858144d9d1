//! In-process container runtime.
//!
//! `MemoryRuntime` keeps containers and images in memory and plays back a
//! scripted [`Behavior`] when a container starts. It is what the cluster,
//! engine, and API tests run against.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};

use dockyard_core::ImageName;

use crate::demux::{StreamKind, encode_frame};
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{ContainerRuntime, LogOptions};
use crate::stream::{EventStream, LogStream};
use crate::wire::{
    ContainerInspect, ContainerSummary, CreateContainer, HostPort, ImageSummary, InspectConfig,
    InspectState, NetworkSettings, PortSummary, RuntimeEvent, Version,
};

/// Exit code of a container stopped or killed by signal.
pub const SIGKILL_EXIT: i32 = 137;

/// What a container does once started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// Write `stdout` and `stderr`, then exit with `code`.
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// Run until stopped or killed.
    Hang,
    /// Close the log stream but keep running.
    Detach,
}

impl Behavior {
    pub fn exit(code: i32) -> Self {
        Behavior::Exit {
            code,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn exit_with_output(code: i32, stdout: impl Into<String>) -> Self {
        Behavior::Exit {
            code,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

impl Default for Behavior {
    fn default() -> Self {
        Behavior::exit(0)
    }
}

struct MemContainer {
    id: String,
    name: String,
    config: CreateContainer,
    running: bool,
    exit_code: i32,
    behavior: Behavior,
    output: Vec<(StreamKind, Bytes)>,
    followers: Vec<mpsc::Sender<Bytes>>,
}

impl MemContainer {
    fn halt(&mut self, exit_code: i32) {
        self.running = false;
        self.exit_code = exit_code;
        self.followers.clear();
    }

    fn frames(&self, opts: &LogOptions) -> Vec<Bytes> {
        self.output
            .iter()
            .filter(|(kind, _)| match kind {
                StreamKind::Stdout => opts.stdout,
                StreamKind::Stderr => opts.stderr,
            })
            .map(|(kind, data)| encode_frame(*kind, data))
            .collect()
    }

    fn summary(&self) -> ContainerSummary {
        let ports = if self.running {
            self.config
                .host_config
                .port_bindings
                .iter()
                .flat_map(|(key, bindings)| {
                    let (port, proto) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
                    let private_port = port.parse().unwrap_or(0);
                    bindings.iter().map(move |b| PortSummary {
                        ip: b.host_ip.clone(),
                        private_port,
                        public_port: b.host_port.parse().ok(),
                        proto: proto.to_string(),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };
        ContainerSummary {
            id: self.id.clone(),
            names: vec![format!("/{}", self.name)],
            image: self.config.image.clone(),
            state: if self.running { "running" } else { "exited" }.to_string(),
            status: String::new(),
            ports,
            labels: self.config.labels.clone(),
        }
    }

    fn inspect(&self) -> ContainerInspect {
        let ports: HashMap<String, Option<Vec<HostPort>>> = if self.running {
            self.config
                .host_config
                .port_bindings
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect()
        } else {
            HashMap::new()
        };
        ContainerInspect {
            id: self.id.clone(),
            name: format!("/{}", self.name),
            state: InspectState {
                status: if self.running { "running" } else { "exited" }.to_string(),
                running: self.running,
                exit_code: self.exit_code,
            },
            config: InspectConfig {
                image: self.config.image.clone(),
                labels: self.config.labels.clone(),
            },
            network_settings: NetworkSettings { ports },
        }
    }
}

#[derive(Default)]
struct MemoryState {
    containers: BTreeMap<String, MemContainer>,
    images: BTreeSet<String>,
    unpullable: HashSet<String>,
    image_behaviors: HashMap<String, Behavior>,
    name_behaviors: HashMap<String, Behavior>,
    fail_creates: u32,
    fail_starts: u32,
    unreachable: bool,
    next_id: u64,
    pulled: Vec<String>,
    calls: Vec<String>,
    stops: Vec<(String, u32)>,
    subscribers: Vec<mpsc::Sender<RuntimeResult<RuntimeEvent>>>,
}

impl MemoryState {
    fn resolve(&self, key: &str) -> RuntimeResult<String> {
        if self.containers.contains_key(key) {
            return Ok(key.to_string());
        }
        self.containers
            .values()
            .find(|c| c.name == key)
            .map(|c| c.id.clone())
            .ok_or_else(|| RuntimeError::NoSuchContainer(key.to_string()))
    }

    fn get_mut(&mut self, key: &str) -> RuntimeResult<&mut MemContainer> {
        let id = self.resolve(key)?;
        self.containers
            .get_mut(&id)
            .ok_or(RuntimeError::NoSuchContainer(id))
    }

    fn emit(&mut self, status: &str, id: &str, from: &str) {
        let event = RuntimeEvent {
            status: status.to_string(),
            id: id.to_string(),
            from: from.to_string(),
            time: epoch_secs(),
        };
        self.subscribers
            .retain(|tx| tx.try_send(Ok(event.clone())).is_ok() || !tx.is_closed());
    }
}

/// A container runtime living entirely in memory.
#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the image cache.
    pub fn with_image(mut self, reference: &str) -> Self {
        self.state
            .get_mut()
            .images
            .insert(ImageName::parse(reference).to_string());
        self
    }

    /// Behavior of containers created from `image`.
    pub async fn set_behavior(&self, image: &str, behavior: Behavior) {
        self.state
            .lock()
            .await
            .image_behaviors
            .insert(ImageName::parse(image).to_string(), behavior);
    }

    /// Behavior of the container named `name`; wins over the image's.
    pub async fn set_container_behavior(&self, name: &str, behavior: Behavior) {
        self.state
            .lock()
            .await
            .name_behaviors
            .insert(name.to_string(), behavior);
    }

    /// Make pulls of `image` fail.
    pub async fn set_unpullable(&self, image: &str) {
        self.state
            .lock()
            .await
            .unpullable
            .insert(ImageName::parse(image).to_string());
    }

    /// Refuse every call as if the socket were gone.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }

    /// Fail the next `n` creates with a server error.
    pub async fn fail_creates(&self, n: u32) {
        self.state.lock().await.fail_creates = n;
    }

    /// Fail the next `n` starts with a server error, leaving the container created.
    pub async fn fail_starts(&self, n: u32) {
        self.state.lock().await.fail_starts = n;
    }

    /// References pulled so far, in order.
    pub async fn pulled(&self) -> Vec<String> {
        self.state.lock().await.pulled.clone()
    }

    /// Stop calls so far as `(container name, grace period)`.
    pub async fn stop_timeouts(&self) -> Vec<(String, u32)> {
        self.state.lock().await.stops.clone()
    }

    /// Mutating calls so far as `"<op> <container name>"`.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn container(&self, key: &str) -> Option<ContainerInspect> {
        let state = self.state.lock().await;
        let id = state.resolve(key).ok()?;
        state.containers.get(&id).map(MemContainer::inspect)
    }

    pub async fn container_count(&self) -> usize {
        self.state.lock().await.containers.len()
    }

    async fn guard(&self) -> RuntimeResult<tokio::sync::MutexGuard<'_, MemoryState>> {
        let state = self.state.lock().await;
        if state.unreachable {
            return Err(RuntimeError::Connect(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "runtime unreachable",
            )));
        }
        Ok(state)
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn version(&self) -> RuntimeResult<Version> {
        self.guard().await?;
        Ok(Version {
            version: "memory".to_string(),
            api_version: "1.41".to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        })
    }

    async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<ContainerSummary>> {
        let state = self.guard().await?;
        Ok(state
            .containers
            .values()
            .filter(|c| all || c.running)
            .map(MemContainer::summary)
            .collect())
    }

    async fn list_images(&self) -> RuntimeResult<Vec<ImageSummary>> {
        let state = self.guard().await?;
        Ok(state
            .images
            .iter()
            .enumerate()
            .map(|(i, tag)| ImageSummary {
                id: format!("sha256:{i:064x}"),
                repo_tags: Some(vec![tag.clone()]),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerInspect> {
        let mut state = self.guard().await?;
        Ok(state.get_mut(id)?.inspect())
    }

    async fn create_container(
        &self,
        name: Option<&str>,
        config: &CreateContainer,
    ) -> RuntimeResult<String> {
        let mut state = self.guard().await?;
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(RuntimeError::Status {
                status: 500,
                message: "create failed".to_string(),
            });
        }
        let image = ImageName::parse(&config.image).to_string();
        if !state.images.contains(&image) {
            return Err(RuntimeError::NoSuchImage(config.image.clone()));
        }

        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        let name = match name {
            Some(n) => {
                if state.containers.values().any(|c| c.name == n) {
                    return Err(RuntimeError::Conflict(format!(
                        "container name {n} is already in use"
                    )));
                }
                n.to_string()
            }
            None => format!("mem_{}", state.next_id),
        };
        let behavior = state
            .name_behaviors
            .get(&name)
            .or_else(|| state.image_behaviors.get(&image))
            .cloned()
            .unwrap_or_default();

        state.calls.push(format!("create {name}"));
        state.containers.insert(
            id.clone(),
            MemContainer {
                id: id.clone(),
                name,
                config: config.clone(),
                running: false,
                exit_code: 0,
                behavior,
                output: Vec::new(),
                followers: Vec::new(),
            },
        );
        state.emit("create", &id, &image);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.guard().await?;
        if state.fail_starts > 0 {
            state.fail_starts -= 1;
            return Err(RuntimeError::Status {
                status: 500,
                message: "start failed".to_string(),
            });
        }
        let c = state.get_mut(id)?;
        if c.running {
            return Ok(());
        }
        c.running = true;
        let (id, name, image) = (c.id.clone(), c.name.clone(), c.config.image.clone());
        let exited = match c.behavior.clone() {
            Behavior::Exit {
                code,
                stdout,
                stderr,
            } => {
                if !stdout.is_empty() {
                    c.output.push((StreamKind::Stdout, Bytes::from(stdout)));
                }
                if !stderr.is_empty() {
                    c.output.push((StreamKind::Stderr, Bytes::from(stderr)));
                }
                c.halt(code);
                true
            }
            Behavior::Hang | Behavior::Detach => false,
        };
        state.calls.push(format!("start {name}"));
        state.emit("start", &id, &image);
        if exited {
            state.emit("die", &id, &image);
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout_secs: u32) -> RuntimeResult<()> {
        let mut state = self.guard().await?;
        let c = state.get_mut(id)?;
        let was_running = c.running;
        if was_running {
            c.halt(SIGKILL_EXIT);
        }
        let (id, name, image) = (c.id.clone(), c.name.clone(), c.config.image.clone());
        state.calls.push(format!("stop {name}"));
        state.stops.push((name, timeout_secs));
        if was_running {
            state.emit("die", &id, &image);
        }
        Ok(())
    }

    async fn kill_container(&self, id: &str, _signal: Option<&str>) -> RuntimeResult<()> {
        let mut state = self.guard().await?;
        let c = state.get_mut(id)?;
        if !c.running {
            return Err(RuntimeError::Conflict(format!(
                "container {} is not running",
                c.name
            )));
        }
        c.halt(SIGKILL_EXIT);
        let (id, name, image) = (c.id.clone(), c.name.clone(), c.config.image.clone());
        state.calls.push(format!("kill {name}"));
        state.emit("die", &id, &image);
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool, _volumes: bool) -> RuntimeResult<()> {
        let mut state = self.guard().await?;
        let key = state.resolve(id)?;
        match state.containers.get(&key) {
            Some(c) if c.running && !force => {
                return Err(RuntimeError::Conflict(format!(
                    "container {} is running",
                    c.name
                )));
            }
            _ => {}
        }
        if let Some(c) = state.containers.remove(&key) {
            let image = c.config.image.clone();
            state.calls.push(format!("remove {}", c.name));
            state.emit("destroy", &key, &image);
        }
        Ok(())
    }

    async fn container_logs(&self, id: &str, opts: &LogOptions) -> RuntimeResult<LogStream> {
        let mut state = self.guard().await?;
        let c = state.get_mut(id)?;
        let frames = c.frames(opts);
        if opts.follow && c.running && c.behavior != Behavior::Detach {
            let (tx, rx) = mpsc::channel(frames.len().max(1) + 16);
            for f in frames {
                let _ = tx.try_send(f);
            }
            c.followers.push(tx);
            return Ok(LogStream::Channel(rx));
        }
        Ok(LogStream::buffered(frames))
    }

    async fn pull_image(&self, reference: &str) -> RuntimeResult<()> {
        let mut state = self.guard().await?;
        let image = ImageName::parse(reference).to_string();
        if state.unpullable.contains(&image) {
            return Err(RuntimeError::Status {
                status: 500,
                message: format!("pull access denied for {reference}"),
            });
        }
        state.pulled.push(reference.to_string());
        state.images.insert(image);
        Ok(())
    }

    async fn events(&self) -> RuntimeResult<EventStream> {
        let mut state = self.guard().await?;
        let (tx, rx) = mpsc::channel(256);
        state.subscribers.push(tx);
        Ok(EventStream::new(rx))
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config(image: &str) -> CreateContainer {
        CreateContainer {
            image: image.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn exit_behavior_records_code_and_output() {
        let rt = MemoryRuntime::new().with_image("alpine");
        rt.set_behavior("alpine", Behavior::exit_with_output(3, "boom\n"))
            .await;

        let id = rt.create_container(Some("job"), &make_config("alpine")).await.unwrap();
        rt.start_container(&id).await.unwrap();

        let inspect = rt.inspect_container("job").await.unwrap();
        assert!(!inspect.state.running);
        assert_eq!(inspect.state.exit_code, 3);

        let out = rt
            .container_logs(&id, &LogOptions::default())
            .await
            .unwrap()
            .read_demuxed(1024)
            .await
            .unwrap();
        assert_eq!(&out[..], b"boom\n");
    }

    #[tokio::test]
    async fn follow_ends_when_hanging_container_is_stopped() {
        let rt = std::sync::Arc::new(MemoryRuntime::new().with_image("alpine"));
        rt.set_behavior("alpine", Behavior::Hang).await;
        let id = rt.create_container(None, &make_config("alpine")).await.unwrap();
        rt.start_container(&id).await.unwrap();

        let logs = rt.container_logs(&id, &LogOptions::follow()).await.unwrap();
        let waiter = tokio::spawn(async move { logs.drain().await });

        rt.stop_container(&id, 1).await.unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(rt.inspect_container(&id).await.unwrap().state.exit_code, SIGKILL_EXIT);
    }

    #[tokio::test]
    async fn create_requires_image_and_unique_name() {
        let rt = MemoryRuntime::new();
        let err = rt.create_container(None, &make_config("redis")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NoSuchImage(_)));

        rt.pull_image("redis").await.unwrap();
        rt.create_container(Some("r"), &make_config("redis:latest")).await.unwrap();
        let err = rt.create_container(Some("r"), &make_config("redis")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Conflict(_)));
    }

    #[tokio::test]
    async fn kill_of_stopped_container_conflicts() {
        let rt = MemoryRuntime::new().with_image("alpine");
        let id = rt.create_container(None, &make_config("alpine")).await.unwrap();
        rt.start_container(&id).await.unwrap();
        assert!(matches!(
            rt.kill_container(&id, None).await,
            Err(RuntimeError::Conflict(_))
        ));
        rt.remove_container(&id, true, true).await.unwrap();
        assert_eq!(rt.container_count().await, 0);
    }

    #[tokio::test]
    async fn events_report_lifecycle() {
        let rt = MemoryRuntime::new().with_image("alpine");
        let mut events = rt.events().await.unwrap();
        let id = rt.create_container(None, &make_config("alpine")).await.unwrap();
        rt.start_container(&id).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(events.next().await.unwrap().unwrap().status);
        }
        assert_eq!(seen, vec!["create", "start", "die"]);
    }

    #[tokio::test]
    async fn unreachable_fails_every_call() {
        let rt = MemoryRuntime::new();
        rt.set_unreachable(true).await;
        assert!(rt.version().await.unwrap_err().is_unreachable());
        assert!(rt.list_containers(true).await.unwrap_err().is_unreachable());
    }
}
