//! Per-pipeline job executor.
//!
//! Owns the FIFO queue, bounded concurrency, retry/backoff, cooperative
//! cancellation, and persistence of job lifecycle transitions for exactly
//! one pipeline.
//!
//! # Architecture
//!
//! ```text
//! JobExecutor
//!     │
//!     ├─► create_job / retry  ──► persist queued, emit job:created, wake
//!     ├─► dispatch loop       ──► pops queue while active < max_concurrent
//!     └─► dispatch task       ──► mark running ─► worker.execute
//!                                   │ success        │ failure
//!                                   ▼                ▼
//!                              finalize         classify ─► retry w/ backoff
//!                                                        └► finalize failed
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::JobEvent;
use super::job::{GitContext, Job, JobError, JobStatus};
use super::repository::JobRepository;
use super::worker::{JobContext, ProgressReporter, Worker};
use crate::config::Config;
use crate::kernel::classifier::{classify, Classification, WorkerError};
use crate::kernel::event_hub::EventHub;
use crate::kernel::git_workflow::{GitWorkflow, GitWorkflowOptions};

/// Backoff schedule for retryable failures:
/// `delay = min(base * mult^(attempts - 1), max)`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f32,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let exponent = (attempts - 1).max(0).min(30);
        let factor = f64::from(self.multiplier).powi(exponent);
        let delay = self.base.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }
}

/// Tunables for one executor. Defaults come from global config; descriptors
/// may override per pipeline.
#[derive(Clone)]
pub struct ExecutorOptions {
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub job_timeout: Duration,
    /// How long `cancel` waits for a running worker to yield before
    /// reporting best-effort.
    pub cancel_grace: Duration,
    pub backoff: BackoffPolicy,
    /// Git workflow settings; `None` disables the pre/post branch steps.
    pub git: Option<GitWorkflowOptions>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_retries: 3,
            job_timeout: Duration::from_secs(300),
            cancel_grace: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            git: None,
        }
    }
}

impl ExecutorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent: config.max_concurrent.max(1) as usize,
            max_retries: 3,
            job_timeout: config.job_timeout(),
            cancel_grace: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            git: config.enable_git_workflow.then(|| GitWorkflowOptions {
                repo_dir: config
                    .git_repo_dir
                    .clone()
                    .map(Into::into)
                    .unwrap_or_else(|| ".".into()),
                ..Default::default()
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("job {job_id} not found")]
    NotFound { job_id: String },

    #[error("job {job_id} is already in terminal state {status:?}")]
    AlreadyTerminal { job_id: String, status: JobStatus },

    #[error("job {job_id} has status {status:?}; only failed jobs can be retried")]
    NotRetryable { job_id: String, status: JobStatus },

    #[error("pipeline {pipeline_id} is shutting down")]
    ShuttingDown { pipeline_id: String },

    #[error("failed to persist job: {0}")]
    Persist(String),

    #[error("invalid job input: {0}")]
    InvalidInput(String),
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job reached a terminal state within the grace period.
    Cancelled,
    /// Cancellation was signalled but the worker has not yielded yet; the
    /// job remains running until it does.
    BestEffort,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExecutorStats {
    pub active: usize,
    pub queued: usize,
    pub completed_total: u64,
    pub failed_total: u64,
}

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<String>,
    active: usize,
    shutting_down: bool,
}

/// Executor for one pipeline. Constructed via [`JobExecutor::start`], which
/// spawns the dispatch loop; shared as `Arc`.
pub struct JobExecutor {
    pipeline_id: String,
    worker: Arc<dyn Worker>,
    repository: Arc<JobRepository>,
    events: EventHub,
    options: ExecutorOptions,
    git: Option<GitWorkflow>,
    dispatch: Mutex<DispatchState>,
    /// Cancellation tokens for jobs currently being dispatched.
    cancellations: Mutex<HashMap<String, CancellationToken>>,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    wake: Notify,
    shutdown_token: CancellationToken,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("pipeline_id", &self.pipeline_id)
            .finish_non_exhaustive()
    }
}

impl JobExecutor {
    /// Build the executor and spawn its dispatch loop.
    pub fn start(
        pipeline_id: impl Into<String>,
        worker: Arc<dyn Worker>,
        repository: Arc<JobRepository>,
        events: EventHub,
        options: ExecutorOptions,
    ) -> Arc<Self> {
        let git = options.git.clone().map(GitWorkflow::new);
        let executor = Arc::new(Self {
            pipeline_id: pipeline_id.into(),
            worker,
            repository,
            events,
            options,
            git,
            dispatch: Mutex::new(DispatchState::default()),
            cancellations: Mutex::new(HashMap::new()),
            completed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            wake: Notify::new(),
            shutdown_token: CancellationToken::new(),
        });

        let dispatcher = executor.clone();
        tokio::spawn(dispatcher.dispatch_loop());

        executor
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn stats(&self) -> ExecutorStats {
        let dispatch = self.dispatch.lock().unwrap();
        ExecutorStats {
            active: dispatch.active,
            queued: dispatch.queue.len(),
            completed_total: self.completed_total.load(Ordering::SeqCst),
            failed_total: self.failed_total.load(Ordering::SeqCst),
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Create a job in state `queued`, persist it, emit `job:created`, and
    /// trigger dispatch.
    pub async fn create_job(
        &self,
        data: serde_json::Value,
        git_context: Option<GitContext>,
    ) -> Result<Job, ExecutorError> {
        if self.dispatch.lock().unwrap().shutting_down {
            return Err(ExecutorError::ShuttingDown {
                pipeline_id: self.pipeline_id.clone(),
            });
        }
        if !(data.is_object() || data.is_null()) {
            return Err(ExecutorError::InvalidInput(
                "job data must be a JSON object".to_string(),
            ));
        }
        let data = if data.is_null() {
            serde_json::json!({})
        } else {
            data
        };

        let mut job = Job::builder()
            .pipeline_id(self.pipeline_id.clone())
            .data(data)
            .max_retries(self.options.max_retries as i32)
            .build();
        job.git_context = git_context;

        self.repository
            .save(&job)
            .await
            .map_err(|e| ExecutorError::Persist(e.to_string()))?;

        // Publish before enqueueing so `job:created` always precedes
        // `job:started` from a fast dispatch.
        self.events.publish(JobEvent::created(&job)).await;
        self.enqueue(job.job_id.clone());
        info!(pipeline_id = %self.pipeline_id, job_id = %job.job_id, "job created");

        Ok(job)
    }

    /// Cancel a job.
    ///
    /// Queued jobs leave the queue and fail immediately with
    /// `error.cancelled = true`. Running jobs get their cancellation token
    /// signalled; if the worker does not yield within the grace period the
    /// result is [`CancelOutcome::BestEffort`] and the job stays running
    /// until the worker returns.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome, ExecutorError> {
        let job = self.fetch_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(ExecutorError::AlreadyTerminal {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }

        let was_queued = {
            let mut dispatch = self.dispatch.lock().unwrap();
            match dispatch.queue.iter().position(|id| id == job_id) {
                Some(index) => {
                    dispatch.queue.remove(index);
                    true
                }
                None => false,
            }
        };

        if was_queued {
            self.finalize_cancelled(job).await;
            return Ok(CancelOutcome::Cancelled);
        }

        let token = self.cancellations.lock().unwrap().get(job_id).cloned();
        match token {
            Some(token) => {
                token.cancel();
                let deadline = Instant::now() + self.options.cancel_grace;
                loop {
                    if !self.cancellations.lock().unwrap().contains_key(job_id) {
                        return Ok(CancelOutcome::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        warn!(
                            job_id = %job_id,
                            "worker did not observe cancellation within grace period"
                        );
                        return Ok(CancelOutcome::BestEffort);
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
            None if job.status == JobStatus::Queued => {
                // Waiting out a retry backoff: not in the dispatch queue yet.
                self.finalize_cancelled(job).await;
                Ok(CancelOutcome::Cancelled)
            }
            None => Ok(CancelOutcome::BestEffort),
        }
    }

    /// Re-run a failed job's input as a fresh job.
    pub async fn retry(&self, job_id: &str) -> Result<Job, ExecutorError> {
        let job = self.fetch_job(job_id).await?;
        if job.status != JobStatus::Failed {
            return Err(ExecutorError::NotRetryable {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }
        if self.dispatch.lock().unwrap().shutting_down {
            return Err(ExecutorError::ShuttingDown {
                pipeline_id: self.pipeline_id.clone(),
            });
        }

        let retried = job.retry_of();
        self.repository
            .save(&retried)
            .await
            .map_err(|e| ExecutorError::Persist(e.to_string()))?;

        self.events.publish(JobEvent::created(&retried)).await;
        self.enqueue(retried.job_id.clone());
        info!(
            pipeline_id = %self.pipeline_id,
            source_job_id = %job_id,
            job_id = %retried.job_id,
            "failed job retried as new job"
        );

        Ok(retried)
    }

    /// Stop accepting work, wait up to `grace` for active jobs to finish,
    /// then cancel stragglers and shut the worker down.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut dispatch = self.dispatch.lock().unwrap();
            if dispatch.shutting_down {
                return;
            }
            dispatch.shutting_down = true;
        }
        info!(pipeline_id = %self.pipeline_id, "executor shutting down");

        let deadline = Instant::now() + grace;
        loop {
            let active = self.dispatch.lock().unwrap().active;
            if active == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    pipeline_id = %self.pipeline_id,
                    active,
                    "grace period elapsed; signalling cancellation to running jobs"
                );
                for token in self.cancellations.lock().unwrap().values() {
                    token.cancel();
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        self.shutdown_token.cancel();
        if let Err(shutdown_error) = self.worker.shutdown().await {
            warn!(
                pipeline_id = %self.pipeline_id,
                error = %shutdown_error,
                "worker shutdown hook failed"
            );
        }
        info!(pipeline_id = %self.pipeline_id, "executor stopped");
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    async fn dispatch_loop(self: Arc<Self>) {
        debug!(pipeline_id = %self.pipeline_id, "dispatch loop started");
        loop {
            for (job_id, token) in self.claim_ready() {
                tokio::spawn(self.clone().run_job(job_id, token));
            }

            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                _ = self.wake.notified() => {}
            }
        }
        debug!(pipeline_id = %self.pipeline_id, "dispatch loop stopped");
    }

    /// Pop queued ids while a concurrency slot is free. The mutex is held
    /// only across the queue/counter updates; dispatch tasks run outside it.
    fn claim_ready(&self) -> Vec<(String, CancellationToken)> {
        let mut claimed = Vec::new();
        let mut dispatch = self.dispatch.lock().unwrap();
        while dispatch.active < self.options.max_concurrent && !dispatch.shutting_down {
            let Some(job_id) = dispatch.queue.pop_front() else {
                break;
            };
            dispatch.active += 1;
            let token = CancellationToken::new();
            self.cancellations
                .lock()
                .unwrap()
                .insert(job_id.clone(), token.clone());
            claimed.push((job_id, token));
        }
        claimed
    }

    fn enqueue(&self, job_id: String) {
        let mut dispatch = self.dispatch.lock().unwrap();
        if dispatch.shutting_down {
            return;
        }
        dispatch.queue.push_back(job_id);
        drop(dispatch);
        self.wake.notify_one();
    }

    async fn run_job(self: Arc<Self>, job_id: String, cancel: CancellationToken) {
        if let Err(dispatch_error) = self.clone().drive(&job_id, cancel).await {
            error!(
                pipeline_id = %self.pipeline_id,
                job_id = %job_id,
                error = %dispatch_error,
                "job dispatch failed"
            );
        }

        self.cancellations.lock().unwrap().remove(&job_id);
        {
            let mut dispatch = self.dispatch.lock().unwrap();
            dispatch.active = dispatch.active.saturating_sub(1);
        }
        self.wake.notify_one();
    }

    async fn drive(self: Arc<Self>, job_id: &str, cancel: CancellationToken) -> anyhow::Result<()> {
        let Some(mut job) = self.repository.get(job_id).await? else {
            anyhow::bail!("job {job_id} missing from repository");
        };
        if job.status != JobStatus::Queued {
            // Cancelled (or otherwise finalized) between enqueue and dispatch.
            debug!(job_id = %job_id, status = ?job.status, "skipping dispatch");
            return Ok(());
        }

        let first_attempt = job.attempts == 0;
        job.begin_attempt();
        if let Err(persist_error) = self.repository.save(&job).await {
            warn!(job_id = %job_id, error = %persist_error, "failed to persist running transition");
        }
        if first_attempt {
            self.events.publish(JobEvent::started(&job)).await;
        }
        debug!(
            pipeline_id = %self.pipeline_id,
            job_id = %job_id,
            attempt = job.attempts,
            "executing job"
        );

        // Git pre-step; its failure is classified like any worker error.
        let mut scope = None;
        let mut pre_step_error = None;
        if let Some(git) = &self.git {
            match git.begin(&job).await {
                Ok(branch_scope) => scope = Some(branch_scope),
                Err(git_error) => pre_step_error = Some(WorkerError::from(git_error)),
            }
        }

        let exec_result = match pre_step_error {
            Some(error) => Err(error),
            None => self.execute_worker(&job, cancel).await,
        };

        if let Some(scope) = scope {
            match &exec_result {
                Ok(_) => {
                    let message = self.worker.commit_message(&job);
                    let pr = self.worker.pr_context(&job);
                    match scope.finish_success(&message, &pr).await {
                        Ok(outcome) => {
                            let context = job.git_context.get_or_insert_with(GitContext::default);
                            context.branch = Some(outcome.branch);
                            context.base_branch = Some(outcome.base_branch);
                            context.commit = outcome.commit;
                        }
                        Err(git_error) => {
                            warn!(job_id = %job_id, error = %git_error, "git finalization failed");
                        }
                    }
                }
                Err(_) => {
                    if let Err(git_error) = scope.finish_failure().await {
                        warn!(job_id = %job_id, error = %git_error, "git rollback failed");
                    }
                }
            }
        }

        match exec_result {
            Ok(result) => self.finalize_success(job, result).await,
            Err(worker_error) => {
                let class = classify(&worker_error);
                if class.retryable && job.attempts <= self.options.max_retries as i32 {
                    self.clone().schedule_retry(job, worker_error, class).await;
                } else {
                    self.finalize_failure(job, worker_error, class).await;
                }
            }
        }

        Ok(())
    }

    /// Run the worker in its own task so a panic is contained and mapped to
    /// a non-retryable internal failure, bounded by the per-job timeout.
    async fn execute_worker(
        &self,
        job: &Job,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, WorkerError> {
        let ctx = JobContext {
            job_id: job.job_id.clone(),
            pipeline_id: job.pipeline_id.clone(),
            data: job.data.clone(),
            attempt: job.attempts,
            cancellation: cancel,
            progress: ProgressReporter::new(
                self.events.clone(),
                job.pipeline_id.clone(),
                job.job_id.clone(),
            ),
        };
        let worker = self.worker.clone();
        let handle = tokio::spawn(async move { worker.execute(ctx).await });
        let abort = handle.abort_handle();

        match tokio::time::timeout(self.options.job_timeout, handle).await {
            Err(_elapsed) => {
                abort.abort();
                Err(WorkerError::timeout(format!(
                    "execution exceeded the {}ms job timeout",
                    self.options.job_timeout.as_millis()
                )))
            }
            Ok(Err(join_error)) if join_error.is_panic() => {
                Err(WorkerError::panic("worker panicked during execution"))
            }
            Ok(Err(_aborted)) => Err(WorkerError::cancelled("worker task aborted")),
            Ok(Ok(result)) => result,
        }
    }

    async fn schedule_retry(self: Arc<Self>, mut job: Job, error: WorkerError, class: Classification) {
        let delay = self.options.backoff.delay_for(job.attempts);
        warn!(
            pipeline_id = %self.pipeline_id,
            job_id = %job.job_id,
            attempt = job.attempts,
            reason = class.reason,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retryable failure; scheduling re-enqueue"
        );

        job.requeue();
        if let Err(persist_error) = self.repository.save(&job).await {
            warn!(job_id = %job.job_id, error = %persist_error, "failed to persist retry transition");
        }
        self.events
            .publish(JobEvent::progress(
                &job,
                serde_json::json!({
                    "retry": {
                        "attempt": job.attempts,
                        "next_attempt": job.attempts + 1,
                        "delay_ms": delay.as_millis() as u64,
                        "reason": class.reason,
                    }
                }),
            ))
            .await;

        // Tail-insertion after the delay keeps fairness with newly created
        // jobs.
        let executor = self.clone();
        let job_id = job.job_id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            executor.enqueue(job_id);
        });
    }

    async fn finalize_success(&self, mut job: Job, result: serde_json::Value) {
        job.finish_success(result);
        if let Err(persist_error) = self.repository.save(&job).await {
            // In-memory terminal state wins; recovery drains later.
            error!(job_id = %job.job_id, error = %persist_error, "failed to persist completed job");
        }
        self.completed_total.fetch_add(1, Ordering::SeqCst);
        info!(
            pipeline_id = %self.pipeline_id,
            job_id = %job.job_id,
            attempts = job.attempts,
            duration_ms = job.duration_ms().unwrap_or(0),
            "job completed"
        );
        self.events.publish(JobEvent::completed(&job)).await;
    }

    async fn finalize_failure(&self, mut job: Job, error: WorkerError, class: Classification) {
        let job_error = JobError::from_worker(&error);
        job.finish_failure(job_error.clone());
        if let Err(persist_error) = self.repository.save(&job).await {
            error!(job_id = %job.job_id, error = %persist_error, "failed to persist failed job");
        }
        self.failed_total.fetch_add(1, Ordering::SeqCst);
        warn!(
            pipeline_id = %self.pipeline_id,
            job_id = %job.job_id,
            attempts = job.attempts,
            reason = class.reason,
            error = %error,
            "job failed"
        );
        self.events.publish(JobEvent::failed(&job, job_error)).await;
    }

    async fn finalize_cancelled(&self, mut job: Job) {
        let job_error = JobError::cancelled("job cancelled before execution");
        job.finish_failure(job_error.clone());
        if let Err(persist_error) = self.repository.save(&job).await {
            error!(job_id = %job.job_id, error = %persist_error, "failed to persist cancelled job");
        }
        self.failed_total.fetch_add(1, Ordering::SeqCst);
        info!(pipeline_id = %self.pipeline_id, job_id = %job.job_id, "queued job cancelled");
        self.events.publish(JobEvent::failed(&job, job_error)).await;
    }

    async fn fetch_job(&self, job_id: &str) -> Result<Job, ExecutorError> {
        match self.repository.get(job_id).await {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(ExecutorError::NotFound {
                job_id: job_id.to_string(),
            }),
            Err(repo_error) => Err(ExecutorError::Persist(repo_error.to_string())),
        }
    }
}
