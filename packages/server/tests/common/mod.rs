//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use aleph_core::kernel::classifier::WorkerError;
use aleph_core::kernel::event_hub::{EventHub, EventSubscription};
use aleph_core::kernel::jobs::{
    BackoffPolicy, ExecutorOptions, Job, JobContext, JobEvent, JobExecutor, JobRepository,
    MemoryJobStore, Worker,
};

/// Fast options for tests: small backoff, short grace.
pub fn test_options() -> ExecutorOptions {
    ExecutorOptions {
        max_concurrent: 2,
        max_retries: 3,
        job_timeout: Duration::from_secs(5),
        cancel_grace: Duration::from_millis(500),
        backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            multiplier: 2.0,
            max: Duration::from_millis(40),
        },
        git: None,
    }
}

pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub repository: Arc<JobRepository>,
    pub events: EventHub,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let repository = Arc::new(JobRepository::new(store.clone(), 1000));
        Self {
            store,
            repository,
            events: EventHub::new(),
        }
    }

    pub fn executor(
        &self,
        pipeline_id: &str,
        worker: Arc<dyn Worker>,
        options: ExecutorOptions,
    ) -> Arc<JobExecutor> {
        JobExecutor::start(
            pipeline_id,
            worker,
            self.repository.clone(),
            self.events.clone(),
            options,
        )
    }
}

/// Poll until the job reaches a terminal state.
pub async fn wait_for_terminal(repository: &JobRepository, job_id: &str, timeout: Duration) -> Job {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(job) = repository.get(job_id).await.unwrap() {
            if job.status.is_terminal() {
                return job;
            }
        }
        assert!(
            Instant::now() < deadline,
            "job {job_id} did not reach a terminal state within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive the next event or panic after the timeout.
pub async fn next_event(subscription: &mut EventSubscription, timeout: Duration) -> JobEvent {
    tokio::time::timeout(timeout, subscription.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Fails `failures` times with the given code, then succeeds.
pub struct FlakyWorker {
    remaining: AtomicI32,
    code: &'static str,
}

impl FlakyWorker {
    pub fn new(failures: i32, code: &'static str) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicI32::new(failures),
            code,
        })
    }
}

#[async_trait]
impl Worker for FlakyWorker {
    async fn execute(&self, ctx: JobContext) -> Result<serde_json::Value, WorkerError> {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
            Err(WorkerError::new("transient upstream failure").with_code(self.code))
        } else {
            Ok(json!({ "attempt": ctx.attempt }))
        }
    }
}

/// Holds a concurrency slot until cancelled (or a long sleep elapses).
pub struct BlockingWorker {
    pub hold: Duration,
}

#[async_trait]
impl Worker for BlockingWorker {
    async fn execute(&self, ctx: JobContext) -> Result<serde_json::Value, WorkerError> {
        tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                Err(WorkerError::cancelled("observed cancellation token"))
            }
            _ = tokio::time::sleep(self.hold) => Ok(json!({ "held_ms": self.hold.as_millis() as u64 })),
        }
    }
}

/// Tracks the maximum number of concurrent executions it observed.
pub struct GaugeWorker {
    active: AtomicUsize,
    max_seen: AtomicUsize,
    pub hold: Duration,
}

impl GaugeWorker {
    pub fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            hold,
        })
    }

    pub fn max_seen(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for GaugeWorker {
    async fn execute(&self, _ctx: JobContext) -> Result<serde_json::Value, WorkerError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({}))
    }
}

/// Ignores the cancellation token and outlives any reasonable timeout.
pub struct SleepyWorker;

#[async_trait]
impl Worker for SleepyWorker {
    async fn execute(&self, _ctx: JobContext) -> Result<serde_json::Value, WorkerError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!({}))
    }
}

/// Panics on every execution.
pub struct PanickyWorker;

#[async_trait]
impl Worker for PanickyWorker {
    async fn execute(&self, _ctx: JobContext) -> Result<serde_json::Value, WorkerError> {
        panic!("worker exploded");
    }
}
