//! Job infrastructure: the persistent, concurrency-bounded execution core.
//!
//! - [`Job`] — the job record and its state machine
//! - [`JobRepository`] — durable-but-available persistence (degraded mode)
//! - [`JobExecutor`] — per-pipeline queue, dispatch, retry, cancellation
//! - [`WorkerRegistry`] — lazy, race-free pipeline resolution
//! - [`Worker`] — the plug-in contract pipelines implement
//!
//! # Architecture
//!
//! ```text
//! API trigger ──► WorkerRegistry.get(pipeline) ──► JobExecutor
//!                                                     │
//!                    JobRepository ◄── persist ────────┤
//!                    EventHub      ◄── lifecycle ──────┤
//!                                                      └─► Worker.execute
//! ```

pub mod events;
mod executor;
mod job;
mod registry;
mod repository;
pub mod store;
mod worker;

pub use events::JobEvent;
pub use executor::{
    BackoffPolicy, CancelOutcome, ExecutorError, ExecutorOptions, ExecutorStats, JobExecutor,
};
pub use job::{new_job_id, short_id, GitContext, Job, JobError, JobStatus};
pub use registry::{PipelineInfo, RegistryError, WorkerRegistry};
pub use repository::{
    JobRepository, RecoveryPolicy, RepositoryError, RepositoryHealth, RepositoryStatus,
};
pub use store::{JobFilter, JobStore, MemoryJobStore, PostgresJobStore, StoreError};
pub use worker::{
    EchoWorker, JobContext, ProgressReporter, Worker, WorkerDescriptor, WorkerFactory,
};
