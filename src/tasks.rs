use crate::gameflip::auth::Credentials;
use crate::publisher::{ListingPublisher, PublishError, PublishJob};
use chrono::{DateTime, Utc};
use rand::{SeedableRng, rngs::SmallRng, seq::IndexedRandom};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("task `{0}` is already running")]
    Conflict(String),
    #[error("task `{0}` not found")]
    NotFound(String),
    #[error("task has no jobs to publish")]
    EmptySource,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskState {
    pub task_id: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub error_count: u64,
}

impl TaskState {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            is_active: true,
            created_at: Utc::now(),
            last_success_at: None,
            success_count: 0,
            error_count: 0,
        }
    }
}

/// Where a task loop draws its next job from.
#[derive(Debug, Clone)]
pub enum JobSource {
    Single(PublishJob),
    RoundRobin(Vec<PublishJob>),
    /// Uniform random pick on every iteration.
    Shuffled(Vec<PublishJob>),
}

impl JobSource {
    fn is_empty(&self) -> bool {
        match self {
            JobSource::Single(_) => false,
            JobSource::RoundRobin(jobs) | JobSource::Shuffled(jobs) => jobs.is_empty(),
        }
    }
}

struct JobCursor {
    source: JobSource,
    position: usize,
    rng: SmallRng,
}

impl JobCursor {
    fn new(source: JobSource) -> Self {
        Self {
            source,
            position: 0,
            rng: SmallRng::from_os_rng(),
        }
    }

    fn next(&mut self) -> Option<&PublishJob> {
        match &self.source {
            JobSource::Single(job) => Some(job),
            JobSource::RoundRobin(jobs) => {
                if jobs.is_empty() {
                    return None;
                }
                let job = &jobs[self.position % jobs.len()];
                self.position += 1;
                Some(job)
            }
            JobSource::Shuffled(jobs) => jobs.choose(&mut self.rng),
        }
    }
}

pub struct TaskSpec {
    pub task_id: Option<String>,
    pub credentials: Credentials,
    pub source: JobSource,
    pub interval: Duration,
}

struct TaskEntry {
    state: TaskState,
    cancel: CancellationToken,
}

#[derive(Clone)]
struct QueuedJob {
    job_id: String,
    credentials: Credentials,
    job: PublishJob,
}

struct GlobalControl {
    cancel: CancellationToken,
    generation: u64,
    running: bool,
    interval: Duration,
    success_count: u64,
    error_count: u64,
}

#[derive(Default)]
struct GlobalBatch {
    jobs: RwLock<Vec<QueuedJob>>,
    control: Mutex<GlobalControl>,
}

impl Default for GlobalControl {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            generation: 0,
            running: false,
            interval: Duration::from_secs(60),
            success_count: 0,
            error_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalBatchStatus {
    pub running: bool,
    pub queued_jobs: Vec<String>,
    pub interval_secs: u64,
    pub success_count: u64,
    pub error_count: u64,
}

/// Owns every publishing loop. Each task has its own cancellation token; the
/// global batch has one shared queue and a token replaced on every restart.
#[derive(Clone)]
pub struct TaskSupervisor {
    publisher: ListingPublisher,
    tasks: Arc<RwLock<HashMap<String, TaskEntry>>>,
    global: Arc<GlobalBatch>,
}

impl TaskSupervisor {
    pub fn new(publisher: ListingPublisher) -> Self {
        Self {
            publisher,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            global: Arc::new(GlobalBatch::default()),
        }
    }

    pub async fn start(&self, spec: TaskSpec) -> Result<String, SupervisorError> {
        if spec.source.is_empty() {
            return Err(SupervisorError::EmptySource);
        }
        let task_id = spec
            .task_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cancel = CancellationToken::new();
        {
            let mut guard = self.tasks.write().await;
            if guard.contains_key(&task_id) {
                return Err(SupervisorError::Conflict(task_id));
            }
            guard.insert(
                task_id.clone(),
                TaskEntry {
                    state: TaskState::new(&task_id),
                    cancel: cancel.clone(),
                },
            );
        }

        info!(
            target = "mcflip.tasks",
            %task_id,
            interval_secs = spec.interval.as_secs(),
            "task_started"
        );
        tokio::spawn(self.clone().run_task(
            task_id.clone(),
            spec.credentials,
            JobCursor::new(spec.source),
            spec.interval,
            cancel,
        ));
        Ok(task_id)
    }

    /// Flags the task as stopped and returns its counters. The loop notices
    /// on its next boundary and unregisters itself.
    pub async fn stop(&self, task_id: &str) -> Result<TaskState, SupervisorError> {
        let mut guard = self.tasks.write().await;
        let entry = guard
            .get_mut(task_id)
            .ok_or_else(|| SupervisorError::NotFound(task_id.to_string()))?;
        entry.state.is_active = false;
        entry.cancel.cancel();
        info!(target = "mcflip.tasks", task_id, "task_stop_requested");
        Ok(entry.state.clone())
    }

    pub async fn status(&self) -> BTreeMap<String, TaskState> {
        let guard = self.tasks.read().await;
        guard
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state.clone()))
            .collect()
    }

    /// Stops every task and the global batch. Returns the ids that were
    /// running, including the cleared global batch jobs.
    pub async fn stop_all(&self) -> Vec<String> {
        let mut stopped = Vec::new();
        {
            let mut guard = self.tasks.write().await;
            for (id, entry) in guard.iter_mut() {
                if entry.state.is_active {
                    entry.state.is_active = false;
                    entry.cancel.cancel();
                    stopped.push(id.clone());
                }
            }
        }
        stopped.sort();
        stopped.extend(self.stop_global().await);
        info!(target = "mcflip.tasks", stopped = stopped.len(), "global_stop");
        stopped
    }

    async fn run_task(
        self,
        task_id: String,
        credentials: Credentials,
        mut cursor: JobCursor,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        while !cancel.is_cancelled() {
            let Some(job) = cursor.next() else { break };
            let outcome = self.publisher.publish(&credentials, job).await;
            self.record(&task_id, outcome.map(|result| result.listing_id))
                .await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        self.tasks.write().await.remove(&task_id);
        info!(target = "mcflip.tasks", %task_id, "task_exited");
    }

    async fn record(&self, task_id: &str, outcome: Result<String, PublishError>) {
        let mut guard = self.tasks.write().await;
        let Some(entry) = guard.get_mut(task_id) else {
            return;
        };
        match outcome {
            Ok(listing_id) => {
                entry.state.success_count += 1;
                entry.state.last_success_at = Some(Utc::now());
                info!(target = "mcflip.tasks", task_id, %listing_id, "task_published");
            }
            Err(err) => {
                entry.state.error_count += 1;
                warn!(target = "mcflip.tasks", task_id, error = %err, "task_publish_failed");
            }
        }
    }

    /// Appends to the global batch and starts its loop if it is idle.
    pub async fn enqueue_global(
        &self,
        credentials: Credentials,
        job: PublishJob,
        interval: Duration,
    ) -> String {
        let job_id = Uuid::new_v4().to_string();
        self.global.jobs.write().await.push(QueuedJob {
            job_id: job_id.clone(),
            credentials,
            job,
        });

        let mut control = self.global.control.lock().await;
        control.interval = interval;
        if !control.running {
            control.cancel = CancellationToken::new();
            control.generation += 1;
            control.running = true;
            tokio::spawn(
                self.clone()
                    .run_global(control.generation, control.cancel.clone()),
            );
            info!(target = "mcflip.tasks", generation = control.generation, "global_batch_started");
        }
        job_id
    }

    pub async fn global_status(&self) -> GlobalBatchStatus {
        let queued_jobs = self
            .global
            .jobs
            .read()
            .await
            .iter()
            .map(|queued| queued.job_id.clone())
            .collect();
        let control = self.global.control.lock().await;
        GlobalBatchStatus {
            running: control.running,
            queued_jobs,
            interval_secs: control.interval.as_secs(),
            success_count: control.success_count,
            error_count: control.error_count,
        }
    }

    async fn stop_global(&self) -> Vec<String> {
        let mut control = self.global.control.lock().await;
        control.cancel.cancel();
        control.running = false;
        control.generation += 1;
        let cleared: Vec<QueuedJob> = std::mem::take(&mut *self.global.jobs.write().await);
        cleared.into_iter().map(|queued| queued.job_id).collect()
    }

    async fn run_global(self, generation: u64, cancel: CancellationToken) {
        'batch: while !cancel.is_cancelled() {
            let snapshot = self.global.jobs.read().await.clone();
            if snapshot.is_empty() {
                break;
            }
            for queued in &snapshot {
                if cancel.is_cancelled() {
                    break 'batch;
                }
                let outcome = self.publisher.publish(&queued.credentials, &queued.job).await;
                let interval = {
                    let mut control = self.global.control.lock().await;
                    match &outcome {
                        Ok(result) => {
                            control.success_count += 1;
                            info!(
                                target = "mcflip.tasks",
                                job_id = %queued.job_id,
                                listing_id = %result.listing_id,
                                "global_batch_published"
                            );
                        }
                        Err(err) => {
                            control.error_count += 1;
                            warn!(
                                target = "mcflip.tasks",
                                job_id = %queued.job_id,
                                error = %err,
                                "global_batch_publish_failed"
                            );
                        }
                    }
                    control.interval
                };
                tokio::select! {
                    _ = cancel.cancelled() => break 'batch,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }

        let mut control = self.global.control.lock().await;
        if control.generation == generation {
            control.running = false;
        }
        info!(target = "mcflip.tasks", generation, "global_batch_exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gameflip::client::ApiClient;
    use crate::gameflip::transport::mock::{MockTransport, failure, success};
    use crate::gameflip::transport::RequestBody;
    use reqwest::Method;
    use serde_json::json;

    fn job(name: &str) -> PublishJob {
        serde_json::from_value(json!({ "name": name, "price": 100 })).unwrap()
    }

    fn supervisor(transport: Arc<MockTransport>) -> TaskSupervisor {
        let api = ApiClient::new(transport, "https://api.test");
        TaskSupervisor::new(ListingPublisher::new(api))
    }

    fn accepting() -> Arc<MockTransport> {
        MockTransport::new(|_| success(json!({ "id": "L1" })))
    }

    fn spec(task_id: &str, source: JobSource) -> TaskSpec {
        TaskSpec {
            task_id: Some(task_id.to_string()),
            credentials: Credentials::new("key", "secret"),
            source,
            interval: Duration::from_secs(30),
        }
    }

    fn drafted_names(transport: &MockTransport) -> Vec<String> {
        transport
            .requests()
            .iter()
            .filter(|r| r.method == Method::POST && r.url.ends_with("/listing"))
            .filter_map(|r| match &r.body {
                RequestBody::Json(body) => body["name"].as_str().map(str::to_string),
                _ => None,
            })
            .collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_conflicts() {
        let sup = supervisor(accepting());
        sup.start(spec("t1", JobSource::Single(job("a"))))
            .await
            .unwrap();
        let err = sup
            .start(spec("t1", JobSource::Single(job("a"))))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Conflict(id) if id == "t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_until_unregistered() {
        let sup = supervisor(accepting());
        sup.start(spec("t1", JobSource::Single(job("a"))))
            .await
            .unwrap();
        settle().await;

        let first = sup.stop("t1").await.unwrap();
        assert!(!first.is_active);
        assert_eq!(first.success_count, 1);
        assert!(sup.stop("t1").await.is_ok());

        settle().await;
        assert!(sup.status().await.is_empty());
        assert!(matches!(
            sup.stop("t1").await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_id_can_be_reused_after_exit() {
        let sup = supervisor(accepting());
        sup.start(spec("t1", JobSource::Single(job("a"))))
            .await
            .unwrap();
        sup.stop("t1").await.unwrap();
        settle().await;

        sup.start(spec("t1", JobSource::Single(job("b"))))
            .await
            .expect("new run under the same id once the old one exited");
        assert!(sup.status().await["t1"].is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_counted_and_the_loop_keeps_going() {
        let transport = MockTransport::new(|_| failure(400, "Invalid listing"));
        let sup = supervisor(transport.clone());
        sup.start(spec("t1", JobSource::Single(job("a"))))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;

        let state = sup.status().await["t1"].clone();
        assert!(state.is_active);
        assert_eq!(state.error_count, 3);
        assert_eq!(state.success_count, 0);
        assert!(state.last_success_at.is_none());
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn round_robin_cycles_through_jobs() {
        let transport = accepting();
        let sup = supervisor(transport.clone());
        sup.start(spec(
            "t1",
            JobSource::RoundRobin(vec![job("a"), job("b")]),
        ))
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        sup.stop("t1").await.unwrap();

        assert_eq!(drafted_names(&transport)[..3], ["a", "b", "a"]);
    }

    #[tokio::test]
    async fn empty_source_is_rejected() {
        let sup = supervisor(accepting());
        let err = sup
            .start(spec("t1", JobSource::Shuffled(Vec::new())))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::EmptySource));
    }

    #[tokio::test(start_paused = true)]
    async fn global_batch_runs_every_queued_job_until_stopped() {
        let transport = accepting();
        let sup = supervisor(transport.clone());
        let creds = Credentials::new("key", "secret");
        let first = sup
            .enqueue_global(creds.clone(), job("a"), Duration::from_secs(10))
            .await;
        let second = sup
            .enqueue_global(creds, job("b"), Duration::from_secs(10))
            .await;
        sup.start(spec("t1", JobSource::Single(job("solo"))))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(15)).await;
        let status = sup.global_status().await;
        assert!(status.running);
        assert_eq!(status.queued_jobs, vec![first.clone(), second.clone()]);
        assert_eq!(status.success_count, 2);

        let stopped = sup.stop_all().await;
        assert_eq!(stopped, vec!["t1".to_string(), first, second]);
        settle().await;

        let status = sup.global_status().await;
        assert!(!status.running);
        assert!(status.queued_jobs.is_empty());
        assert!(sup.status().await.is_empty());
        let names = drafted_names(&transport);
        assert!(names.contains(&"a".to_string()) && names.contains(&"b".to_string()));
    }
}
