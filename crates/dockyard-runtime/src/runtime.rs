//! The `ContainerRuntime` trait: the wire API every host speaks.

use async_trait::async_trait;

use crate::error::RuntimeResult;
use crate::stream::{EventStream, LogStream};
use crate::wire::{ContainerInspect, ContainerSummary, CreateContainer, ImageSummary, Version};

/// Which output a log request returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub stdout: bool,
    pub stderr: bool,
    /// Keep the stream open until the container exits.
    pub follow: bool,
    /// Only the last N lines.
    pub tail: Option<u64>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            stdout: true,
            stderr: true,
            follow: false,
            tail: None,
        }
    }
}

impl LogOptions {
    pub fn follow() -> Self {
        Self {
            follow: true,
            ..Self::default()
        }
    }

    pub(crate) fn to_query(&self) -> String {
        let mut q = format!(
            "stdout={}&stderr={}&follow={}",
            self.stdout as u8, self.stderr as u8, self.follow as u8
        );
        match self.tail {
            Some(n) => q.push_str(&format!("&tail={n}")),
            None => q.push_str("&tail=all"),
        }
        q
    }
}

/// Operations on one container-runtime endpoint.
///
/// Containers are addressed by id or name.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn version(&self) -> RuntimeResult<Version>;

    /// Running containers, or every container when `all` is set.
    async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<ContainerSummary>>;

    async fn list_images(&self) -> RuntimeResult<Vec<ImageSummary>>;

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerInspect>;

    /// Create a container and return its id. Fails with `NoSuchImage` when
    /// the image is not in the local cache.
    async fn create_container(
        &self,
        name: Option<&str>,
        config: &CreateContainer,
    ) -> RuntimeResult<String>;

    async fn start_container(&self, id: &str) -> RuntimeResult<()>;

    /// Stop with a grace period before the runtime sends SIGKILL.
    async fn stop_container(&self, id: &str, timeout_secs: u32) -> RuntimeResult<()>;

    async fn kill_container(&self, id: &str, signal: Option<&str>) -> RuntimeResult<()>;

    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> RuntimeResult<()>;

    async fn container_logs(&self, id: &str, opts: &LogOptions) -> RuntimeResult<LogStream>;

    /// Pull `reference` into the local cache.
    async fn pull_image(&self, reference: &str) -> RuntimeResult<()>;

    /// Subscribe to container lifecycle events.
    async fn events(&self) -> RuntimeResult<EventStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_query() {
        assert_eq!(
            LogOptions::follow().to_query(),
            "stdout=1&stderr=1&follow=1&tail=all"
        );
        let opts = LogOptions {
            stderr: false,
            tail: Some(50),
            ..LogOptions::default()
        };
        assert_eq!(opts.to_query(), "stdout=1&stderr=0&follow=0&tail=50");
    }
}
