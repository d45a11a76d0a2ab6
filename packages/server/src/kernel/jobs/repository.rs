//! Job repository: durable-but-available persistence.
//!
//! Wraps a [`JobStore`] and keeps jobs flowing through transient storage
//! failures. After five consecutive write failures the repository enters
//! degraded mode: writes land in a bounded in-memory FIFO (and `save`
//! returns ok), reads overlay the pending queue so the process observes its
//! own writes, and a background recovery task drains the queue with
//! exponential backoff until the store comes back.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::{JobFilter, JobStore, StoreError};
use super::Job;
use crate::common::validation::is_valid_job_id;

/// Consecutive write failures before degraded mode is entered.
const DEGRADED_THRESHOLD: u32 = 5;

/// Bound on the degraded-mode write queue.
const WRITE_QUEUE_LIMIT: usize = 10_000;

/// Recovery rounds before the critical signal is raised.
const RECOVERY_FAILURE_ALERT: u32 = 10;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("invalid job id: {id}")]
    InvalidJobId { id: String },

    #[error("persistence failed: {0}")]
    Persist(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositoryHealth {
    pub status: RepositoryStatus,
    pub queued_writes: usize,
    pub recovery_attempts: u32,
    pub consecutive_failures: u32,
}

/// Backoff schedule for the recovery task.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            multiplier: 2.0,
            cap: Duration::from_secs(300),
        }
    }
}

impl RecoveryPolicy {
    fn next(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.multiplier;
        Duration::from_secs_f64(next.min(self.cap.as_secs_f64()))
    }
}

#[derive(Default)]
struct PersistState {
    degraded: bool,
    consecutive_failures: u32,
    recovery_attempts: u32,
    write_queue: VecDeque<Job>,
    /// Latest unflushed write per job id; overlays reads while degraded.
    pending: HashMap<String, Job>,
}

pub struct JobRepository {
    store: Arc<dyn JobStore>,
    state: Mutex<PersistState>,
    recovery_policy: RecoveryPolicy,
    recovery_wake: Notify,
    pagination_max_limit: i64,
}

impl JobRepository {
    pub fn new(store: Arc<dyn JobStore>, pagination_max_limit: u32) -> Self {
        Self {
            store,
            state: Mutex::new(PersistState::default()),
            recovery_policy: RecoveryPolicy::default(),
            recovery_wake: Notify::new(),
            pagination_max_limit: pagination_max_limit.max(1) as i64,
        }
    }

    /// Override the recovery backoff schedule (tests use a fast one).
    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = policy;
        self
    }

    /// Upsert a job by `job_id`.
    ///
    /// In degraded mode the write is queued and `Ok` is returned; in-memory
    /// state is authoritative until recovery drains the queue in FIFO order.
    pub async fn save(&self, job: &Job) -> Result<(), RepositoryError> {
        if !is_valid_job_id(&job.job_id) {
            return Err(RepositoryError::InvalidJobId {
                id: job.job_id.clone(),
            });
        }

        {
            let mut state = self.state.lock().unwrap();
            if state.degraded {
                return Self::enqueue_locked(&mut state, job);
            }
        }

        match self.store.upsert(job).await {
            Ok(()) => {
                self.state.lock().unwrap().consecutive_failures = 0;
                Ok(())
            }
            Err(store_error) => {
                let mut state = self.state.lock().unwrap();
                state.consecutive_failures += 1;
                warn!(
                    job_id = %job.job_id,
                    consecutive_failures = state.consecutive_failures,
                    error = %store_error,
                    "job persist failed"
                );

                if state.consecutive_failures >= DEGRADED_THRESHOLD {
                    if !state.degraded {
                        state.degraded = true;
                        error!(
                            consecutive_failures = state.consecutive_failures,
                            "storage unavailable; entering degraded mode with in-memory write queue"
                        );
                    }
                    let result = Self::enqueue_locked(&mut state, job);
                    drop(state);
                    self.recovery_wake.notify_one();
                    result
                } else {
                    Err(RepositoryError::Persist(store_error.to_string()))
                }
            }
        }
    }

    fn enqueue_locked(state: &mut PersistState, job: &Job) -> Result<(), RepositoryError> {
        if state.write_queue.len() >= WRITE_QUEUE_LIMIT {
            return Err(RepositoryError::Persist(
                "degraded-mode write queue is full".to_string(),
            ));
        }
        state.write_queue.push_back(job.clone());
        state.pending.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    /// Fetch a job by id. Pending (unflushed) writes win over the store so
    /// reads observe writes in program order.
    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, RepositoryError> {
        if !is_valid_job_id(job_id) {
            return Err(RepositoryError::InvalidJobId {
                id: job_id.to_string(),
            });
        }

        if let Some(job) = self.state.lock().unwrap().pending.get(job_id).cloned() {
            return Ok(Some(job));
        }

        self.store
            .fetch(job_id)
            .await
            .map_err(|e| RepositoryError::Persist(e.to_string()))
    }

    /// List jobs, newest first, with pagination clamped to
    /// `[1, pagination_max_limit]` and `offset >= 0`.
    pub async fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64), RepositoryError> {
        if let Some(pipeline_id) = &filter.pipeline_id {
            if !is_valid_job_id(pipeline_id) {
                return Err(RepositoryError::InvalidJobId {
                    id: pipeline_id.clone(),
                });
            }
        }

        let mut clamped = filter.clone();
        clamped.limit = clamped.limit.clamp(1, self.pagination_max_limit);
        clamped.offset = clamped.offset.max(0);

        let pending = self.pending_matching(&clamped);

        match self.store.list(&clamped).await {
            Ok((jobs, total)) => Ok(Self::overlay(jobs, total, pending, &clamped)),
            Err(store_error) => {
                if self.state.lock().unwrap().degraded {
                    // Store unreadable: serve the in-memory overlay alone.
                    let total = pending.len() as u64;
                    let offset = clamped.offset as usize;
                    let limit = clamped.limit as usize;
                    let page = pending.into_iter().skip(offset).take(limit).collect();
                    Ok((page, total))
                } else {
                    Err(RepositoryError::Persist(store_error.to_string()))
                }
            }
        }
    }

    pub async fn count(&self, filter: &JobFilter) -> Result<u64, RepositoryError> {
        match self.store.count(filter).await {
            Ok(count) => Ok(count),
            Err(store_error) => {
                if self.state.lock().unwrap().degraded {
                    Ok(self.pending_matching(filter).len() as u64)
                } else {
                    Err(RepositoryError::Persist(store_error.to_string()))
                }
            }
        }
    }

    fn pending_matching(&self, filter: &JobFilter) -> Vec<Job> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<Job> = state
            .pending
            .values()
            .filter(|job| {
                filter
                    .pipeline_id
                    .as_ref()
                    .map_or(true, |p| &job.pipeline_id == p)
                    && filter.status.map_or(true, |s| job.status == s)
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs
    }

    fn overlay(
        mut jobs: Vec<Job>,
        total: u64,
        pending: Vec<Job>,
        filter: &JobFilter,
    ) -> (Vec<Job>, u64) {
        if pending.is_empty() {
            return (jobs, total);
        }

        let mut added = 0u64;
        for pending_job in pending {
            if let Some(slot) = jobs.iter_mut().find(|j| j.job_id == pending_job.job_id) {
                *slot = pending_job;
            } else {
                jobs.push(pending_job);
                added += 1;
            }
        }
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs.truncate(filter.limit.max(0) as usize);
        (jobs, total + added)
    }

    pub fn get_health(&self) -> RepositoryHealth {
        let state = self.state.lock().unwrap();
        RepositoryHealth {
            status: if state.degraded {
                RepositoryStatus::Degraded
            } else {
                RepositoryStatus::Healthy
            },
            queued_writes: state.write_queue.len(),
            recovery_attempts: state.recovery_attempts,
            consecutive_failures: state.consecutive_failures,
        }
    }

    /// Spawn the background recovery task. It sleeps until degraded mode is
    /// entered, then retries draining the write queue with exponential
    /// backoff (5s, x2, capped at 5 min by default).
    pub fn spawn_recovery(repo: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = repo.recovery_wake.notified() => {}
                }

                let mut delay = repo.recovery_policy.initial;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }

                    match repo.drain_queue().await {
                        Ok(()) => {
                            info!("storage recovered; write queue drained, leaving degraded mode");
                            break;
                        }
                        Err(drain_error) => {
                            let attempts = {
                                let mut state = repo.state.lock().unwrap();
                                state.recovery_attempts += 1;
                                state.recovery_attempts
                            };
                            if attempts == RECOVERY_FAILURE_ALERT {
                                error!(
                                    recovery_attempts = attempts,
                                    error = %drain_error,
                                    "storage recovery still failing; continuing to retry"
                                );
                            } else {
                                warn!(
                                    recovery_attempts = attempts,
                                    error = %drain_error,
                                    "storage recovery attempt failed"
                                );
                            }
                            delay = repo.recovery_policy.next(delay);
                        }
                    }
                }
            }
        })
    }

    async fn drain_queue(&self) -> Result<(), StoreError> {
        loop {
            let next = self.state.lock().unwrap().write_queue.front().cloned();
            let Some(job) = next else {
                let mut state = self.state.lock().unwrap();
                if state.write_queue.is_empty() {
                    state.degraded = false;
                    state.consecutive_failures = 0;
                    state.recovery_attempts = 0;
                    state.pending.clear();
                }
                return Ok(());
            };

            // Failure leaves the entry at the front: FIFO order is preserved
            // across recovery rounds.
            self.store.upsert(&job).await?;
            let mut state = self.state.lock().unwrap();
            state.write_queue.pop_front();
            debug!(job_id = %job.job_id, remaining = state.write_queue.len(), "drained queued write");
        }
    }

    /// Best-effort flush used by the emergency shutdown path.
    pub async fn flush_best_effort(&self) {
        let queued = self.state.lock().unwrap().write_queue.len();
        if queued == 0 {
            return;
        }
        info!(queued_writes = queued, "flushing degraded write queue");
        if let Err(flush_error) = self.drain_queue().await {
            warn!(error = %flush_error, "best-effort flush did not complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::store::MemoryJobStore;

    fn job_for(pipeline: &str) -> Job {
        Job::builder().pipeline_id(pipeline).build()
    }

    fn repo(store: Arc<MemoryJobStore>) -> JobRepository {
        JobRepository::new(store, 1000)
    }

    #[tokio::test]
    async fn save_rejects_invalid_job_id() {
        let repo = repo(Arc::new(MemoryJobStore::new()));
        let mut job = job_for("echo");
        job.job_id = "bad id!".to_string();
        assert!(matches!(
            repo.save(&job).await,
            Err(RepositoryError::InvalidJobId { .. })
        ));
    }

    #[tokio::test]
    async fn healthy_save_is_written_through() {
        let store = Arc::new(MemoryJobStore::new());
        let repo = repo(store.clone());
        let job = job_for("echo");
        repo.save(&job).await.unwrap();
        assert!(store.fetch(&job.job_id).await.unwrap().is_some());
        assert_eq!(repo.get_health().status, RepositoryStatus::Healthy);
    }

    #[tokio::test]
    async fn degraded_mode_engages_after_threshold() {
        let store = Arc::new(MemoryJobStore::new());
        let repo = repo(store.clone());
        store.set_fail_writes(true);

        let mut failures = 0;
        for i in 0..6 {
            let job = job_for("echo");
            match repo.save(&job).await {
                Ok(()) => assert!(i >= 4, "save {i} should fail before degraded mode"),
                Err(_) => failures += 1,
            }
        }
        assert_eq!(failures, 4);

        let health = repo.get_health();
        assert_eq!(health.status, RepositoryStatus::Degraded);
        assert!(health.queued_writes >= 2);

        // Degraded reads observe the queued write.
        let job = job_for("echo");
        repo.save(&job).await.unwrap();
        let read = repo.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(read.job_id, job.job_id);
    }

    #[tokio::test]
    async fn drain_exits_degraded_mode_and_flushes_fifo() {
        let store = Arc::new(MemoryJobStore::new());
        let repo = repo(store.clone());
        store.set_fail_writes(true);

        let mut queued_ids = Vec::new();
        for _ in 0..7 {
            let job = job_for("echo");
            let _ = repo.save(&job).await;
            queued_ids.push(job.job_id.clone());
        }
        assert_eq!(repo.get_health().status, RepositoryStatus::Degraded);

        store.set_fail_writes(false);
        repo.drain_queue().await.unwrap();

        let health = repo.get_health();
        assert_eq!(health.status, RepositoryStatus::Healthy);
        assert_eq!(health.queued_writes, 0);
        assert_eq!(health.consecutive_failures, 0);

        // Everything that was accepted during the outage reached the store.
        for id in queued_ids.iter().skip(4) {
            assert!(store.fetch(id).await.unwrap().is_some(), "{id} lost");
        }
    }

    #[tokio::test]
    async fn list_overlays_pending_writes() {
        let store = Arc::new(MemoryJobStore::new());
        let repo = repo(store.clone());

        let settled = job_for("echo");
        repo.save(&settled).await.unwrap();

        store.set_fail_writes(true);
        for _ in 0..5 {
            let _ = repo.save(&job_for("echo")).await;
        }
        let degraded_job = job_for("echo");
        repo.save(&degraded_job).await.unwrap();

        let (jobs, _total) = repo
            .list(&JobFilter {
                pipeline_id: Some("echo".to_string()),
                limit: 50,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(jobs.iter().any(|j| j.job_id == degraded_job.job_id));
        assert!(jobs.iter().any(|j| j.job_id == settled.job_id));
    }

    #[tokio::test]
    async fn list_clamps_pagination() {
        let store = Arc::new(MemoryJobStore::new());
        let repo = JobRepository::new(store, 10);
        for _ in 0..15 {
            repo.save(&job_for("echo")).await.unwrap();
        }

        let (jobs, total) = repo
            .list(&JobFilter {
                limit: 9999,
                offset: -5,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 15);
        assert_eq!(jobs.len(), 10);
    }

    #[tokio::test]
    async fn list_rejects_invalid_pipeline_filter() {
        let repo = repo(Arc::new(MemoryJobStore::new()));
        let result = repo
            .list(&JobFilter {
                pipeline_id: Some("bad pipeline!".to_string()),
                ..Default::default()
            })
            .await;
        assert!(matches!(
            result,
            Err(RepositoryError::InvalidJobId { .. })
        ));
    }

    #[tokio::test]
    async fn recovery_task_drains_when_storage_returns() {
        let store = Arc::new(MemoryJobStore::new());
        let repo = Arc::new(
            JobRepository::new(store.clone(), 1000).with_recovery_policy(RecoveryPolicy {
                initial: Duration::from_millis(10),
                multiplier: 2.0,
                cap: Duration::from_millis(50),
            }),
        );
        let shutdown = CancellationToken::new();
        let handle = JobRepository::spawn_recovery(repo.clone(), shutdown.clone());

        store.set_fail_writes(true);
        let mut saved = None;
        for _ in 0..6 {
            let job = job_for("echo");
            if repo.save(&job).await.is_ok() {
                saved = Some(job.job_id.clone());
            }
        }
        assert_eq!(repo.get_health().status, RepositoryStatus::Degraded);

        store.set_fail_writes(false);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while repo.get_health().status != RepositoryStatus::Healthy {
            assert!(std::time::Instant::now() < deadline, "recovery never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let saved = saved.expect("at least one degraded save succeeded");
        assert!(store.fetch(&saved).await.unwrap().is_some());

        shutdown.cancel();
        let _ = handle.await;
    }
}
