//! Where build, job and log records go.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use dockyard_core::{Build, Job};

use crate::error::StoreResult;

/// Persistence collaborator. The engine owns no records itself.
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn update_build(&self, build: &Build) -> StoreResult<()>;
    async fn update_job(&self, job: &Job) -> StoreResult<()>;
    async fn write_log(&self, job: &Job, log: Bytes) -> StoreResult<()>;
}

/// Keeps the latest record of everything, plus every job update in order.
#[derive(Default)]
pub struct MemoryStore {
    builds: Mutex<HashMap<i64, Build>>,
    jobs: Mutex<HashMap<i64, Job>>,
    job_updates: Mutex<Vec<Job>>,
    logs: Mutex<HashMap<i64, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn build(&self, id: i64) -> Option<Build> {
        self.builds.lock().await.get(&id).cloned()
    }

    pub async fn job(&self, id: i64) -> Option<Job> {
        self.jobs.lock().await.get(&id).cloned()
    }

    /// Every `update_job` call so far.
    pub async fn job_updates(&self) -> Vec<Job> {
        self.job_updates.lock().await.clone()
    }

    pub async fn log(&self, job_id: i64) -> Option<Bytes> {
        self.logs.lock().await.get(&job_id).cloned()
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn update_build(&self, build: &Build) -> StoreResult<()> {
        self.builds.lock().await.insert(build.id, build.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> StoreResult<()> {
        self.jobs.lock().await.insert(job.id, job.clone());
        self.job_updates.lock().await.push(job.clone());
        Ok(())
    }

    async fn write_log(&self, job: &Job, log: Bytes) -> StoreResult<()> {
        self.logs.lock().await.insert(job.id, log);
        Ok(())
    }
}
