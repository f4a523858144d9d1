//! Admission policies: may this host run this job?
//!
//! `Ok(false)` means the host is ineligible. `Err(_)` means the policy had
//! to query the host and could not; the caller should treat the host as
//! currently ineligible rather than fail the whole placement.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use dockyard_core::{ImageName, JobSpec};
use dockyard_runtime::Host;

use crate::error::{PlacementError, PlacementResult};

/// Label prefix pinning a job to a host identity.
pub const HOST_CONSTRAINT_PREFIX: &str = "host:";

/// An admission check.
#[async_trait]
pub trait Admit: Send + Sync {
    async fn admit(&self, job: &JobSpec, host: &Host) -> PlacementResult<bool>;
}

/// The built-in policies plus composition.
#[derive(Clone)]
pub enum Policy {
    /// Every non-`host:` label of the job is present on the host.
    Label,
    /// The host's id matches one of the job's `host:<id>` labels.
    HostAffinity,
    /// No running container already uses the job's `name:tag`.
    UniqueImage,
    /// No container already has the job's fixed container name.
    UniqueName,
    /// None of the job's host ports is already bound.
    PortConflict,
    /// The job's image is in the host's local cache.
    ImagePresence,
    /// Every wrapped policy admits, checked in order.
    All(Vec<Policy>),
    /// A policy defined outside this crate.
    Custom(Arc<dyn Admit>),
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::All(ps) => f.debug_tuple("All").field(ps).finish(),
            Policy::Custom(_) => f.write_str("Custom"),
            other => f.write_str(other.name()),
        }
    }
}

impl Policy {
    /// Look up a built-in policy by its configuration name.
    pub fn from_name(name: &str) -> Option<Policy> {
        Some(match name {
            "label" => Policy::Label,
            "host" => Policy::HostAffinity,
            "unique" => Policy::UniqueImage,
            "unique-name" => Policy::UniqueName,
            "port" => Policy::PortConflict,
            "image" => Policy::ImagePresence,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Policy::Label => "label",
            Policy::HostAffinity => "host",
            Policy::UniqueImage => "unique",
            Policy::UniqueName => "unique-name",
            Policy::PortConflict => "port",
            Policy::ImagePresence => "image",
            Policy::All(_) => "all",
            Policy::Custom(_) => "custom",
        }
    }

    /// Build a composite from configuration names. Unknown names are
    /// returned as the error.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Policy, String> {
        let policies = names
            .iter()
            .map(|n| Policy::from_name(n.as_ref()).ok_or_else(|| n.as_ref().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(match <[Policy; 1]>::try_from(policies) {
            Ok([single]) => single,
            Err(many) => Policy::All(many),
        })
    }
}

fn host_constraints(job: &JobSpec) -> impl Iterator<Item = &str> {
    job.labels
        .iter()
        .filter_map(|l| l.strip_prefix(HOST_CONSTRAINT_PREFIX))
}

#[async_trait]
impl Admit for Policy {
    async fn admit(&self, job: &JobSpec, host: &Host) -> PlacementResult<bool> {
        let admitted = match self {
            Policy::Label => job
                .labels
                .iter()
                .filter(|l| !l.starts_with(HOST_CONSTRAINT_PREFIX))
                .all(|l| host.info().labels.contains(l)),

            Policy::HostAffinity => {
                let mut pinned = host_constraints(job).peekable();
                pinned.peek().is_none() || pinned.any(|id| id == host.id())
            }

            Policy::UniqueImage => {
                let wanted = ImageName::parse(&job.name);
                let running = host
                    .containers(false)
                    .await
                    .map_err(|e| PlacementError::host(host.id(), e))?;
                !running.iter().any(|c| wanted.same_as(&c.job.name))
            }

            Policy::UniqueName => match &job.container_name {
                None => true,
                Some(name) => {
                    let all = host
                        .containers(true)
                        .await
                        .map_err(|e| PlacementError::host(host.id(), e))?;
                    !all.iter().any(|c| &c.name == name)
                }
            },

            Policy::PortConflict => {
                if job.bind_ports.is_empty() {
                    true
                } else {
                    let running = host
                        .containers(false)
                        .await
                        .map_err(|e| PlacementError::host(host.id(), e))?;
                    !job.bind_ports.iter().any(|wanted| {
                        running
                            .iter()
                            .flat_map(|c| c.ports.iter())
                            .any(|bound| wanted.collides_with(bound))
                    })
                }
            }

            Policy::ImagePresence => {
                let wanted = ImageName::parse(&job.name);
                let images = host
                    .images()
                    .await
                    .map_err(|e| PlacementError::host(host.id(), e))?;
                images.contains(&wanted)
            }

            Policy::All(policies) => {
                for p in policies {
                    if !p.admit(job, host).await? {
                        return Ok(false);
                    }
                }
                true
            }

            Policy::Custom(inner) => inner.admit(job, host).await?,
        };

        if !matches!(self, Policy::All(_)) {
            debug!(
                host = %host.id(),
                image = %job.name,
                policy = self.name(),
                admitted,
                "admission decision"
            );
        }
        Ok(admitted)
    }
}
