//! Worker error classification.
//!
//! [`classify`] is the single source of truth for retry decisions: workers
//! never decide retryability themselves, and the executor consults nothing
//! else. The function is pure and deterministic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error returned by a worker (or synthesized by the executor for
/// timeouts, panics, and cancellation).
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct WorkerError {
    pub message: String,
    /// Platform-style error code (`ETIMEDOUT`, `ENOENT`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// HTTP-style status when the failure came from an upstream call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default)]
    pub kind: WorkerErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    Validation,
    Timeout,
    Cancelled,
    Panic,
    #[default]
    Other,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: None,
            kind: WorkerErrorKind::Other,
            stack: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: WorkerErrorKind::Validation,
            ..Self::new(message)
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: WorkerErrorKind::Timeout,
            ..Self::new(message)
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: WorkerErrorKind::Cancelled,
            ..Self::new(message)
        }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            kind: WorkerErrorKind::Panic,
            ..Self::new(message)
        }
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match error.kind() {
            ErrorKind::NotFound => Some("ENOENT"),
            ErrorKind::TimedOut => Some("ETIMEDOUT"),
            ErrorKind::ConnectionReset => Some("ECONNRESET"),
            _ => None,
        };

        let mut err = Self::new(error.to_string());
        if let Some(code) = code {
            err.code = Some(code.to_string());
        }
        err
    }
}

impl From<anyhow::Error> for WorkerError {
    fn from(error: anyhow::Error) -> Self {
        if let Some(io) = error.downcast_ref::<std::io::Error>() {
            let mut err = WorkerError::from(std::io::Error::new(io.kind(), io.to_string()));
            err.message = format!("{error:#}");
            return err;
        }
        Self::new(format!("{error:#}"))
    }
}

/// Outcome of classifying a worker error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub retryable: bool,
    pub reason: &'static str,
}

const fn retryable(reason: &'static str) -> Classification {
    Classification {
        retryable: true,
        reason,
    }
}

const fn terminal(reason: &'static str) -> Classification {
    Classification {
        retryable: false,
        reason,
    }
}

/// Classify a worker error into retryable vs. non-retryable.
///
/// Rules are applied first-match-wins; equal-valued errors always classify
/// identically.
pub fn classify(error: &WorkerError) -> Classification {
    if let Some(code) = error.code.as_deref() {
        if matches!(code, "ETIMEDOUT" | "ECONNRESET" | "EAI_AGAIN") {
            return retryable("network");
        }
    }

    if let Some(status) = error.status {
        if (500..=599).contains(&status) {
            return retryable("upstream-5xx");
        }
    }

    // A missing file or directory will not materialize on retry.
    if error.code.as_deref() == Some("ENOENT") {
        return terminal("missing-path");
    }

    if let Some(status) = error.status {
        if (400..=499).contains(&status) {
            return terminal("client-4xx");
        }
    }

    match error.kind {
        WorkerErrorKind::Timeout => retryable("timeout"),
        WorkerErrorKind::Validation => terminal("validation"),
        WorkerErrorKind::Cancelled => terminal("cancelled"),
        WorkerErrorKind::Panic => terminal("internal"),
        WorkerErrorKind::Other => terminal("unknown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_codes_are_retryable() {
        for code in ["ETIMEDOUT", "ECONNRESET", "EAI_AGAIN"] {
            let class = classify(&WorkerError::new("boom").with_code(code));
            assert!(class.retryable, "{code} should be retryable");
            assert_eq!(class.reason, "network");
        }
    }

    #[test]
    fn upstream_5xx_is_retryable() {
        let class = classify(&WorkerError::new("bad gateway").with_status(502));
        assert!(class.retryable);
        assert_eq!(class.reason, "upstream-5xx");
    }

    #[test]
    fn enoent_is_non_retryable() {
        let class = classify(&WorkerError::new("no such file").with_code("ENOENT"));
        assert!(!class.retryable);
        assert_eq!(class.reason, "missing-path");
    }

    #[test]
    fn client_4xx_is_non_retryable() {
        let class = classify(&WorkerError::new("bad request").with_status(400));
        assert!(!class.retryable);
        assert_eq!(class.reason, "client-4xx");
    }

    #[test]
    fn validation_is_non_retryable() {
        let class = classify(&WorkerError::validation("bad payload"));
        assert!(!class.retryable);
        assert_eq!(class.reason, "validation");
    }

    #[test]
    fn timeout_kind_is_retryable() {
        let class = classify(&WorkerError::timeout("took too long"));
        assert!(class.retryable);
        assert_eq!(class.reason, "timeout");
    }

    #[test]
    fn panic_is_internal_and_terminal() {
        let class = classify(&WorkerError::panic("worker panicked"));
        assert!(!class.retryable);
        assert_eq!(class.reason, "internal");
    }

    #[test]
    fn default_is_unknown_and_terminal() {
        let class = classify(&WorkerError::new("mystery"));
        assert!(!class.retryable);
        assert_eq!(class.reason, "unknown");
    }

    #[test]
    fn classification_is_deterministic() {
        let a = WorkerError::new("x").with_code("ETIMEDOUT");
        let b = WorkerError::new("x").with_code("ETIMEDOUT");
        assert_eq!(classify(&a), classify(&b));
    }

    #[test]
    fn code_rules_win_over_kind() {
        // An error that carries ENOENT stays terminal even if flagged timeout.
        let mut err = WorkerError::timeout("late");
        err.code = Some("ENOENT".to_string());
        assert_eq!(classify(&err).reason, "missing-path");
    }

    #[test]
    fn io_not_found_maps_to_enoent() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = WorkerError::from(io);
        assert_eq!(err.code.as_deref(), Some("ENOENT"));
        assert!(!classify(&err).retryable);
    }
}
