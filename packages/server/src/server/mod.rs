//! HTTP surface: typed boundary over the registry, executors, repository,
//! and event hub.

pub mod app;
pub mod error;
pub mod routes;

pub use app::{build_router, AppState};
pub use error::{ApiError, ApiResult};
