//! AlephAuto core: an in-process job queue framework with a real-time
//! observability plane.
//!
//! Pipelines plug in through the worker contract
//! ([`kernel::jobs::Worker`]); the core owns persistence, bounded
//! concurrency, retry/backoff, circuit-breaker protection of the secret
//! source, and event fan-out to streaming subscribers.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::{Config, ConfigError};
