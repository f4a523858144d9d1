//! Execution engine: one ephemeral agent container per job.
//!
//! ```text
//! schedule(task)
//!   └── supervisor task
//!         ├── pool.reserve()                 blocks until a host is free
//!         ├── run_build (own task)           a panic here is caught below
//!         │     ├── assign node, build → Running
//!         │     ├── per job:
//!         │     │     Running → create/start agent → wait (logs EOF | timeout)
//!         │     │     → inspect → classify → logs → kill + remove
//!         │     ├── build → first non-success job status
//!         │     └── notify container
//!         ├── on panic: non-terminal jobs → Error, containers removed
//!         └── pool.release(host)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use dockyard_core::config::EngineConfig;
use dockyard_core::event::{TOPIC_BUILD, TOPIC_JOB};
use dockyard_core::{Build, BuildEvent, Event, Job, JobSpec, Status};
use dockyard_runtime::{Host, LogOptions, LogStream, RuntimeError};

use crate::bus::{EventBus, SubscriptionId};
use crate::error::{EngineError, EngineResult};
use crate::pool::HostPool;
use crate::store::BuildStore;

/// Exit code recorded when the job could not be run at all.
pub const ERROR_EXIT_CODE: i32 = 255;
/// Exit code recorded for timed-out and cancelled jobs.
pub const KILLED_EXIT_CODE: i32 = 137;
/// Exit code recorded when the container was still running after the wait.
pub const INCOMPLETE_EXIT_CODE: i32 = 1;

/// Job type label given to agent containers.
const AGENT_JOB_TYPE: &str = "build";

pub fn job_container_name(build_id: i64, job_id: i64) -> String {
    format!("dockyard_build_{build_id}_job_{job_id}")
}

pub fn notify_container_name(build_id: i64) -> String {
    format!("dockyard_build_{build_id}_notify")
}

/// Map the final container state to a job status and exit code.
///
/// `wait_failed` is set when following the container's output broke off
/// with an error rather than reaching the end.
pub fn classify(running: bool, exit_code: i32, wait_failed: bool) -> (Status, i32) {
    match exit_code {
        _ if running => (Status::Error, INCOMPLETE_EXIT_CODE),
        128 | 130 => (Status::Killed, exit_code),
        _ if wait_failed => (Status::Error, ERROR_EXIT_CODE),
        0 => (Status::Success, 0),
        code => (Status::Failure, code),
    }
}

/// A build and its jobs, ready to run.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct BuildTask {
    pub build: Build,
    pub jobs: Vec<Job>,
    /// Extra fields handed to the agent alongside the build and job.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl BuildTask {
    pub fn new(build: Build, jobs: Vec<Job>) -> Self {
        Self {
            build,
            jobs,
            context: serde_json::Map::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// The agent's single command-line argument.
#[derive(Serialize)]
struct AgentPayload<'a> {
    build: &'a Build,
    job: &'a Job,
    #[serde(flatten)]
    context: &'a serde_json::Map<String, serde_json::Value>,
}

struct ActiveJob {
    job: Job,
    cancelled: bool,
}

/// A build currently holding a pool host.
struct ActiveBuild {
    host: Arc<Host>,
    build: Build,
    jobs: HashMap<i64, ActiveJob>,
}

#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    timeout: Duration,
    pool: Arc<HostPool>,
    bus: Arc<EventBus>,
    store: Arc<dyn BuildStore>,
    active: Arc<Mutex<HashMap<i64, ActiveBuild>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, store: Arc<dyn BuildStore>, bus: Arc<EventBus>) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            config: Arc::new(config),
            pool: Arc::new(HostPool::new()),
            bus,
            store,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Override the per-container timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn pool(&self) -> &HostPool {
        &self.pool
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn subscribe(&self, sink: tokio::sync::mpsc::Sender<Event>) -> SubscriptionId {
        self.bus.subscribe(sink)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    // ── Pool membership ───────────────────────────────────────────

    /// Add a build host after checking its runtime answers. Returns
    /// `false` if it was already in the pool.
    pub async fn allocate(&self, host: Host) -> EngineResult<bool> {
        let version = host.version().await.inspect_err(|e| {
            error!(host = %host.id(), addr = %host.info().addr, error = %e, "cannot reach runtime");
        })?;
        info!(host = %host.id(), addr = %host.info().addr, %version, "registered build host");
        Ok(self.pool.allocate(Arc::new(host)).await)
    }

    pub async fn deallocate(&self, id: &str) -> bool {
        self.pool.deallocate(id).await
    }

    // ── Scheduling ────────────────────────────────────────────────

    /// Run `task` on the next free pool host. The returned handle resolves
    /// once the host has been released.
    pub fn schedule(&self, task: BuildTask) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.supervise(task).await })
    }

    async fn supervise(self, task: BuildTask) {
        let host = self.pool.reserve().await;
        let build_id = task.build.id;
        info!(build = build_id, host = %host.id(), jobs = task.jobs.len(), "build scheduled");
        self.track_build(&host, &task);

        let fallback = task.clone();
        let run = tokio::spawn({
            let engine = self.clone();
            let host = host.clone();
            async move { engine.run_build(host, task).await }
        });

        if let Err(e) = run.await {
            if e.is_panic() {
                error!(build = build_id, host = %host.id(), panic = %panic_message(e.into_panic()), "panic running build");
            } else {
                warn!(build = build_id, host = %host.id(), "build task cancelled");
            }
            self.recover(&host, fallback).await;
        }

        self.lock_active().remove(&build_id);
        self.pool.release(host).await;
    }

    /// Close out a build whose task died: every job not yet finished
    /// becomes `Error` and its containers are removed.
    async fn recover(&self, host: &Arc<Host>, task: BuildTask) {
        let (mut build, jobs) = {
            let active = self.lock_active();
            match active.get(&task.build.id) {
                Some(a) => {
                    let jobs = task
                        .jobs
                        .iter()
                        .map(|j| a.jobs.get(&j.id).map(|aj| aj.job.clone()).unwrap_or_else(|| j.clone()))
                        .collect::<Vec<_>>();
                    (a.build.clone(), jobs)
                }
                None => (task.build, task.jobs),
            }
        };

        for mut job in jobs {
            if !job.status.is_terminal() {
                fail(&mut job);
                self.set_job(&job).await;
            }
            self.cleanup(host, &job_container_name(build.id, job.id)).await;
        }
        self.cleanup(host, &notify_container_name(build.id)).await;

        if !build.status.is_terminal() {
            if let Err(e) = build.advance(Status::Error) {
                warn!(build = build.id, error = %e, "cannot mark build errored");
            }
            build.finished = epoch_secs();
            self.set_build(&build).await;
        }
    }

    async fn run_build(&self, host: Arc<Host>, task: BuildTask) {
        let BuildTask {
            mut build,
            mut jobs,
            context,
        } = task;

        for job in jobs.iter_mut() {
            job.node_id = Some(host.id().to_string());
            self.set_job(job).await;
        }

        build.started = epoch_secs();
        if let Err(e) = build.advance(Status::Running) {
            warn!(build = build.id, error = %e, "unexpected build status");
        }
        self.set_build(&build).await;

        for job in jobs.iter_mut() {
            self.run_job(&host, &build, job, &context).await;
        }

        let outcome = jobs
            .iter()
            .map(|j| j.status)
            .find(|s| *s != Status::Success)
            .unwrap_or(Status::Success);
        if let Err(e) = build.advance(outcome) {
            warn!(build = build.id, error = %e, "unexpected build status");
        }
        build.finished = epoch_secs();
        self.set_build(&build).await;
        info!(build = build.id, status = %build.status, "build finished");

        if let Err(e) = self.run_notify(&host, &build, &jobs, &context).await {
            error!(build = build.id, error = %e, "notification step failed");
        }
    }

    // ── Jobs ──────────────────────────────────────────────────────

    async fn run_job(
        &self,
        host: &Host,
        build: &Build,
        job: &mut Job,
        context: &serde_json::Map<String, serde_json::Value>,
    ) {
        let name = job_container_name(build.id, job.id);
        let result = self.execute_job(host, build, job, context, &name).await;
        if let Err(e) = &result {
            error!(build = build.id, job = job.id, container = %name, error = %e, "job failed to run");
            fail(job);
        }

        let log = match self.fetch_log(host, &name, self.config.log_limit_bytes).await {
            Ok(log) => log,
            Err(fetch_err) => {
                let reason = match &result {
                    Err(e) => e.to_string(),
                    Ok(()) => fetch_err.to_string(),
                };
                Bytes::from(format!("Error launching build: {reason}"))
            }
        };

        job.finished = epoch_secs();
        self.set_job(job).await;
        if let Err(e) = self.store.write_log(job, log).await {
            error!(build = build.id, job = job.id, error = %e, "cannot store job log");
        }
        self.cleanup(host, &name).await;
        info!(build = build.id, job = job.id, status = %job.status, exit_code = job.exit_code, "job finished");
    }

    async fn execute_job(
        &self,
        host: &Host,
        build: &Build,
        job: &mut Job,
        context: &serde_json::Map<String, serde_json::Value>,
        name: &str,
    ) -> EngineResult<()> {
        job.advance(Status::Running)?;
        job.started = epoch_secs();
        self.set_job(job).await;

        let args = match build.event {
            BuildEvent::PullRequest => &self.config.pull_request_args,
            _ => &self.config.build_args,
        };
        let spec = self.agent_spec(build, job, context, name, args)?;
        debug!(build = build.id, job = job.id, container = %name, "starting agent container");
        host.start(&spec, false).await?;

        let waited = self.wait_for_exit(host, name).await;
        let (status, exit_code) = match waited {
            Err(EngineError::Timeout) => {
                warn!(build = build.id, job = job.id, timeout = ?self.timeout, "build timed out");
                self.halt(host, name).await;
                (Status::Killed, KILLED_EXIT_CODE)
            }
            _ if self.is_cancelled(build.id, job.id) => {
                info!(build = build.id, job = job.id, "build cancelled");
                (Status::Killed, KILLED_EXIT_CODE)
            }
            other => {
                if let Err(e) = &other {
                    warn!(build = build.id, job = job.id, error = %e, "lost container output");
                }
                let state = host.inspect(name).await?.state;
                if state.running {
                    error!(build = build.id, job = job.id, container = %name, "incomplete build");
                }
                classify(state.running, state.exit_code, other.is_err())
            }
        };

        job.exit_code = exit_code;
        job.advance(status)?;
        Ok(())
    }

    /// Follow the container's output to the end, or give up at the timeout.
    async fn wait_for_exit(&self, host: &Host, name: &str) -> EngineResult<()> {
        let follow = async {
            let logs = host.logs(name, &LogOptions::follow()).await?;
            logs.drain().await?;
            Ok::<(), EngineError>(())
        };
        tokio::select! {
            r = follow => r,
            _ = tokio::time::sleep(self.timeout) => Err(EngineError::Timeout),
        }
    }

    /// Stop then kill a container that overran.
    async fn halt(&self, host: &Host, name: &str) {
        if let Err(e) = host.stop(name, self.config.stop_timeout_secs).await {
            warn!(container = %name, error = %e, "stop failed");
        }
        match host.kill(name).await {
            Ok(()) | Err(RuntimeError::Conflict(_)) => {}
            Err(e) => warn!(container = %name, error = %e, "kill failed"),
        }
    }

    /// Kill and remove, tolerating a container that is gone or stopped.
    async fn cleanup(&self, host: &Host, name: &str) {
        match host.kill(name).await {
            Ok(()) | Err(RuntimeError::Conflict(_)) | Err(RuntimeError::NoSuchContainer(_)) => {}
            Err(e) => warn!(container = %name, error = %e, "kill failed during cleanup"),
        }
        match host.remove(name).await {
            Ok(()) | Err(RuntimeError::NoSuchContainer(_)) => {}
            Err(e) => warn!(container = %name, error = %e, "remove failed during cleanup"),
        }
    }

    async fn fetch_log(&self, host: &Host, name: &str, limit: usize) -> EngineResult<Bytes> {
        let logs = host.logs(name, &LogOptions::default()).await?;
        Ok(logs.read_demuxed(limit).await?)
    }

    fn agent_spec(
        &self,
        build: &Build,
        job: &Job,
        context: &serde_json::Map<String, serde_json::Value>,
        name: &str,
        args: &[String],
    ) -> EngineResult<JobSpec> {
        let payload = serde_json::to_string(&AgentPayload {
            build,
            job,
            context,
        })?;

        let mut cmd = args.to_vec();
        cmd.push("--".to_string());
        cmd.push(payload);

        let environment: BTreeMap<String, String> = self
            .config
            .env
            .iter()
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let socket = &self.config.socket_path;
        let mut spec = JobSpec::new(self.config.agent_image.clone())
            .with_container_name(name)
            .with_type(AGENT_JOB_TYPE);
        spec.entrypoint = self.config.entrypoint.clone();
        spec.args = cmd;
        spec.environment = environment;
        spec.volumes = vec![format!("{socket}:{socket}")];
        Ok(spec)
    }

    // ── Notification ──────────────────────────────────────────────

    async fn run_notify(
        &self,
        host: &Host,
        build: &Build,
        jobs: &[Job],
        context: &serde_json::Map<String, serde_json::Value>,
    ) -> EngineResult<()> {
        let Some(last) = jobs.last() else {
            return Ok(());
        };
        let name = notify_container_name(build.id);

        let result: EngineResult<()> = async {
            let spec = self.agent_spec(build, last, context, &name, &self.config.notify_args)?;
            host.start(&spec, false).await?;
            let waited = self.wait_for_exit(host, &name).await;
            if matches!(waited, Err(EngineError::Timeout)) {
                self.halt(host, &name).await;
            }
            let exit_code = host.inspect(&name).await?.state.exit_code;
            if exit_code != 0 {
                let output = self
                    .fetch_log(host, &name, self.config.notify_log_limit_bytes)
                    .await
                    .unwrap_or_default();
                info!(
                    container = %name,
                    exit_code,
                    output = %String::from_utf8_lossy(&output),
                    "notification container exited non-zero"
                );
            }
            waited
        }
        .await;

        self.cleanup(host, &name).await;
        result
    }

    // ── Cancel / stream ───────────────────────────────────────────

    /// Stop a running job's container; the job finishes as `Killed`.
    pub async fn cancel(&self, build_id: i64, job_id: i64) -> EngineResult<()> {
        let host = {
            let mut active = self.lock_active();
            let entry = active
                .get_mut(&build_id)
                .and_then(|b| {
                    let host = b.host.clone();
                    b.jobs.get_mut(&job_id).map(|j| (host, j))
                })
                .filter(|(_, j)| j.job.status == Status::Running);
            let Some((host, job)) = entry else {
                return Err(EngineError::JobNotRunning {
                    build: build_id,
                    job: job_id,
                });
            };
            job.cancelled = true;
            host
        };

        let name = job_container_name(build_id, job_id);
        info!(build = build_id, job = job_id, host = %host.id(), "cancelling job");
        if let Err(e) = host.stop(&name, self.config.stop_timeout_secs).await {
            // nothing was stopped, so the exit code stands
            if let Some(job) = self
                .lock_active()
                .get_mut(&build_id)
                .and_then(|b| b.jobs.get_mut(&job_id))
            {
                job.cancelled = false;
            }
            warn!(build = build_id, job = job_id, error = %e, "cancel failed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Follow the output of a job that holds a pool host.
    pub async fn stream(&self, build_id: i64, job_id: i64) -> EngineResult<LogStream> {
        let host = self
            .lock_active()
            .get(&build_id)
            .filter(|b| b.jobs.contains_key(&job_id))
            .map(|b| b.host.clone())
            .ok_or(EngineError::JobNotRunning {
                build: build_id,
                job: job_id,
            })?;
        let name = job_container_name(build_id, job_id);
        debug!(container = %name, "streaming container logs");
        Ok(host.logs(&name, &LogOptions::follow()).await?)
    }

    // ── Status updates ────────────────────────────────────────────

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<i64, ActiveBuild>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track_build(&self, host: &Arc<Host>, task: &BuildTask) {
        let jobs = task
            .jobs
            .iter()
            .map(|j| {
                (
                    j.id,
                    ActiveJob {
                        job: j.clone(),
                        cancelled: false,
                    },
                )
            })
            .collect();
        self.lock_active().insert(
            task.build.id,
            ActiveBuild {
                host: host.clone(),
                build: task.build.clone(),
                jobs,
            },
        );
    }

    fn is_cancelled(&self, build_id: i64, job_id: i64) -> bool {
        self.lock_active()
            .get(&build_id)
            .and_then(|b| b.jobs.get(&job_id))
            .is_some_and(|j| j.cancelled)
    }

    /// Persist and publish a job record.
    async fn set_job(&self, job: &Job) {
        if let Some(entry) = self
            .lock_active()
            .get_mut(&job.build_id)
            .and_then(|b| b.jobs.get_mut(&job.id))
        {
            entry.job = job.clone();
        }
        if let Err(e) = self.store.update_job(job).await {
            error!(job = job.id, error = %e, "cannot store job");
        }
        self.publish(TOPIC_JOB, job);
    }

    /// Persist and publish a build record.
    async fn set_build(&self, build: &Build) {
        if let Some(entry) = self.lock_active().get_mut(&build.id) {
            entry.build = build.clone();
        }
        if let Err(e) = self.store.update_build(build).await {
            error!(build = build.id, error = %e, "cannot store build");
        }
        self.publish(TOPIC_BUILD, build);
    }

    fn publish<T: Serialize>(&self, topic: &str, record: &T) {
        match Event::json(topic, record) {
            Ok(ev) => {
                self.bus.publish(ev);
            }
            Err(e) => warn!(topic, error = %e, "cannot encode event"),
        }
    }
}

/// Mark a job that never reached a normal end as errored.
fn fail(job: &mut Job) {
    if job.status.is_terminal() {
        return;
    }
    let now = epoch_secs();
    if job.started == 0 {
        job.started = now;
    }
    job.finished = now;
    job.exit_code = ERROR_EXIT_CODE;
    if let Err(e) = job.advance(Status::Error) {
        warn!(job = job.id, error = %e, "cannot mark job errored");
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
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

    #[test]
    fn classify_exit_codes() {
        assert_eq!(classify(false, 0, false), (Status::Success, 0));
        assert_eq!(classify(false, 1, false), (Status::Failure, 1));
        assert_eq!(classify(false, 128, false), (Status::Killed, 128));
        assert_eq!(classify(false, 130, false), (Status::Killed, 130));
        assert_eq!(classify(false, 2, true), (Status::Error, ERROR_EXIT_CODE));
    }

    #[test]
    fn still_running_is_incomplete() {
        assert_eq!(classify(true, 0, false), (Status::Error, INCOMPLETE_EXIT_CODE));
        assert_eq!(classify(true, 130, true), (Status::Error, INCOMPLETE_EXIT_CODE));
    }

    #[test]
    fn container_names() {
        assert_eq!(job_container_name(12, 34), "dockyard_build_12_job_34");
        assert_eq!(notify_container_name(12), "dockyard_build_12_notify");
    }

    #[test]
    fn fail_marks_pending_and_running_jobs() {
        let mut pending = Job::new(1, 1, 1);
        fail(&mut pending);
        assert_eq!(pending.status, Status::Error);
        assert_eq!(pending.exit_code, ERROR_EXIT_CODE);
        assert!(pending.started > 0);

        let mut done = Job::new(2, 1, 2);
        done.advance(Status::Running).unwrap();
        done.advance(Status::Success).unwrap();
        fail(&mut done);
        assert_eq!(done.status, Status::Success);
    }

    #[test]
    fn panic_messages() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic");
    }

    fn make_engine(config: EngineConfig) -> Engine {
        Engine::new(
            config,
            Arc::new(crate::store::MemoryStore::new()),
            Arc::new(EventBus::new()),
        )
    }

    #[test]
    fn agent_spec_embeds_payload_and_socket() {
        let mut config = EngineConfig::default();
        config.env = vec!["HTTP_PROXY=http://proxy:3128".to_string()];
        let engine = make_engine(config);

        let build = Build::new(7, 3);
        let job = Job::new(9, 7, 1);
        let task = BuildTask::new(build.clone(), vec![job.clone()])
            .with_context("repo", serde_json::json!({"full_name": "octocat/hello"}));
        let spec = engine
            .agent_spec(&build, &job, &task.context, "dockyard_build_7_job_9", &engine.config.build_args)
            .unwrap();

        assert_eq!(spec.name, "drone/drone-exec:latest");
        assert_eq!(spec.container_name.as_deref(), Some("dockyard_build_7_job_9"));
        assert_eq!(spec.volumes, vec!["/var/run/docker.sock:/var/run/docker.sock"]);
        assert_eq!(spec.environment["HTTP_PROXY"], "http://proxy:3128");

        let n = spec.args.len();
        assert_eq!(spec.args[n - 2], "--");
        let payload: serde_json::Value = serde_json::from_str(&spec.args[n - 1]).unwrap();
        assert_eq!(payload["build"]["id"], 7);
        assert_eq!(payload["job"]["id"], 9);
        assert_eq!(payload["repo"]["full_name"], "octocat/hello");
    }
}
