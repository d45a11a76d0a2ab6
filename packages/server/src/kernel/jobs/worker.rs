//! Worker contract: the plug-in boundary between the core and pipeline
//! implementations.
//!
//! A worker is a capability set of size one (`execute`); everything else has
//! a provided default. Pipelines register a [`WorkerDescriptor`] at startup
//! and the registry resolves it to a singleton executor on first use.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::events::JobEvent;
use super::executor::ExecutorOptions;
use super::job::{short_id, Job};
use crate::kernel::classifier::WorkerError;
use crate::kernel::event_hub::EventHub;
use crate::kernel::git_workflow::PrContext;

/// Lets a worker publish `job:progress` events mid-flight.
#[derive(Clone)]
pub struct ProgressReporter {
    events: EventHub,
    pipeline_id: String,
    job_id: String,
}

impl ProgressReporter {
    pub fn new(events: EventHub, pipeline_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            events,
            pipeline_id: pipeline_id.into(),
            job_id: job_id.into(),
        }
    }

    pub async fn report(&self, payload: serde_json::Value) {
        self.events
            .publish(JobEvent::Progress {
                pipeline_id: self.pipeline_id.clone(),
                job_id: self.job_id.clone(),
                timestamp: Utc::now(),
                payload,
            })
            .await;
    }
}

/// Execution context handed to a worker for one attempt.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub pipeline_id: String,
    /// The job's opaque input blob.
    pub data: serde_json::Value,
    /// 1-based attempt number.
    pub attempt: i32,
    /// Cooperative cancellation: workers observe this at suspension points.
    pub cancellation: CancellationToken,
    /// Mid-flight progress reporting.
    pub progress: ProgressReporter,
}

/// The capability the executor drives. The core treats implementations as
/// black boxes; retryability of their errors is decided by the classifier,
/// never by the worker.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Execute one unit of work.
    async fn execute(&self, ctx: JobContext) -> Result<serde_json::Value, WorkerError>;

    /// Invoked during graceful shutdown. Optional.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Commit message used by the git workflow. Optional.
    fn commit_message(&self, job: &Job) -> String {
        format!(
            "{}: automated update for job {}",
            job.pipeline_id,
            short_id(&job.job_id)
        )
    }

    /// Pull-request context used by the git workflow. Optional.
    fn pr_context(&self, job: &Job) -> PrContext {
        PrContext {
            title: format!("[{}] automated changes", job.pipeline_id),
            body: format!("Automated changes produced by job `{}`.", job.job_id),
        }
    }
}

/// Factory producing a worker instance; invoked lazily by the registry,
/// at most once per pipeline.
pub type WorkerFactory =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Arc<dyn Worker>>> + Send + Sync>;

/// Startup registration record for one pipeline.
#[derive(Clone)]
pub struct WorkerDescriptor {
    pub pipeline_id: String,
    /// Human-readable name surfaced by the pipelines endpoint.
    pub name: String,
    pub factory: WorkerFactory,
    /// Per-pipeline overrides of the executor defaults.
    pub options: Option<ExecutorOptions>,
}

impl WorkerDescriptor {
    pub fn new<F, Fut>(
        pipeline_id: impl Into<String>,
        name: impl Into<String>,
        factory: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<dyn Worker>>> + Send + 'static,
    {
        Self {
            pipeline_id: pipeline_id.into(),
            name: name.into(),
            factory: Arc::new(move || factory().boxed()),
            options: None,
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Built-in smoke-test pipeline: echoes its input back as the result.
pub struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    async fn execute(&self, ctx: JobContext) -> Result<serde_json::Value, WorkerError> {
        Ok(serde_json::json!({ "echoed": ctx.data }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx(data: serde_json::Value) -> JobContext {
        JobContext {
            job_id: "j1".to_string(),
            pipeline_id: "echo".to_string(),
            data,
            attempt: 1,
            cancellation: CancellationToken::new(),
            progress: ProgressReporter::new(EventHub::new(), "echo", "j1"),
        }
    }

    #[tokio::test]
    async fn echo_worker_echoes_input() {
        let ctx = test_ctx(serde_json::json!({"x": 1}));
        let result = EchoWorker.execute(ctx).await.unwrap();
        assert_eq!(result, serde_json::json!({"echoed": {"x": 1}}));
    }

    #[tokio::test]
    async fn default_shutdown_is_ok() {
        assert!(EchoWorker.shutdown().await.is_ok());
    }

    #[test]
    fn default_git_hooks_mention_the_job() {
        let job = Job::builder().pipeline_id("echo").build();
        let message = EchoWorker.commit_message(&job);
        assert!(message.starts_with("echo:"));

        let pr = EchoWorker.pr_context(&job);
        assert!(pr.title.contains("echo"));
        assert!(pr.body.contains(&job.job_id));
    }

    #[tokio::test]
    async fn descriptor_factory_builds_workers() {
        let descriptor = WorkerDescriptor::new("echo", "Echo", || async {
            Ok(Arc::new(EchoWorker) as Arc<dyn Worker>)
        });
        let worker = (descriptor.factory)().await.unwrap();
        assert!(worker.execute(test_ctx(serde_json::json!({}))).await.is_ok());
    }
}
