//! Kernel: infrastructure shared by every pipeline.

pub mod classifier;
pub mod event_hub;
pub mod git_workflow;
pub mod jobs;
pub mod secrets;

pub use classifier::{classify, Classification, WorkerError, WorkerErrorKind};
pub use event_hub::{EventFilter, EventHub, EventSubscription};
pub use git_workflow::{GitWorkflow, GitWorkflowOptions, PrContext};
pub use secrets::{
    CircuitBreakerConfig, CircuitState, EnvSecretSource, HttpSecretSource, SecretError,
    SecretHealth, SecretProvider, SecretSource,
};
