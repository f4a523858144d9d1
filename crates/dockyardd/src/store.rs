//! Build store used by the daemon when no external store is attached.
//! Records are logged and dropped.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use dockyard_core::{Build, Job};
use dockyard_engine::{BuildStore, StoreResult};

pub struct TracingStore;

#[async_trait]
impl BuildStore for TracingStore {
    async fn update_build(&self, build: &Build) -> StoreResult<()> {
        info!(build = build.id, number = build.number, status = %build.status, "build updated");
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> StoreResult<()> {
        info!(
            build = job.build_id,
            job = job.id,
            status = %job.status,
            exit_code = job.exit_code,
            node = job.node_id.as_deref().unwrap_or("-"),
            "job updated"
        );
        Ok(())
    }

    async fn write_log(&self, job: &Job, log: Bytes) -> StoreResult<()> {
        debug!(job = job.id, bytes = log.len(), "job log received");
        Ok(())
    }
}
