//! Application configuration loaded from environment variables.
//!
//! Every option is resolved once at startup; there is no runtime reload.
//! Validation is atomic: any out-of-range value fails the whole load.

use std::env;
use std::time::Duration;

use dotenvy::dotenv;
use thiserror::Error;

/// Errors produced while resolving configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be set")]
    Missing { key: &'static str },

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("{key} must be between {min} and {max} (got {value})")]
    OutOfRange {
        key: &'static str,
        value: String,
        min: String,
        max: String,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind port for the API surface.
    pub api_port: u16,
    /// Backing store connection string. The sentinel `memory:` selects the
    /// in-memory store so the server runs without Postgres.
    pub database_url: String,
    /// Per-executor concurrency ceiling unless overridden per pipeline.
    pub max_concurrent: u32,
    /// Whether workers may create branches/commits/PRs.
    pub enable_git_workflow: bool,
    /// Working directory for the git workflow (defaults to the process cwd).
    pub git_repo_dir: Option<String>,
    /// Consecutive upstream failures before the secret circuit opens.
    pub cb_failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes.
    pub cb_success_threshold: u32,
    /// Open-state cooldown before the next probe is allowed.
    pub cb_cooldown_ms: u32,
    /// Base exponential-backoff delay for upstream retries.
    pub cb_base_delay_ms: u32,
    /// Backoff multiplier per attempt.
    pub cb_backoff_mult: f32,
    /// Backoff ceiling.
    pub cb_max_backoff_ms: u32,
    /// Upper bound for any list endpoint `limit`.
    pub pagination_max_limit: u32,
    /// Per-job execution timeout.
    pub job_timeout_ms: u64,
    /// Grace period for executor shutdown before running jobs are cancelled.
    pub shutdown_grace_ms: u64,
    /// Optional HTTP secret source; when absent, secrets come from the
    /// process environment (`SECRET_*`).
    pub secrets_url: Option<String>,
    pub secrets_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            api_port: port("API_PORT", env::var("API_PORT").ok(), 8080)?,
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing { key: "DATABASE_URL" })?,
            max_concurrent: u32_in("MAX_CONCURRENT", env::var("MAX_CONCURRENT").ok(), 5, 1, 50)?,
            enable_git_workflow: boolean(
                "ENABLE_GIT_WORKFLOW",
                env::var("ENABLE_GIT_WORKFLOW").ok(),
                false,
            )?,
            git_repo_dir: env::var("GIT_REPO_DIR").ok(),
            cb_failure_threshold: u32_in(
                "CB_FAILURE_THRESHOLD",
                env::var("CB_FAILURE_THRESHOLD").ok(),
                3,
                1,
                10,
            )?,
            cb_success_threshold: u32_in(
                "CB_SUCCESS_THRESHOLD",
                env::var("CB_SUCCESS_THRESHOLD").ok(),
                2,
                1,
                10,
            )?,
            cb_cooldown_ms: u32_in(
                "CB_COOLDOWN_MS",
                env::var("CB_COOLDOWN_MS").ok(),
                5000,
                1000,
                u32::MAX,
            )?,
            cb_base_delay_ms: u32_in(
                "CB_BASE_DELAY_MS",
                env::var("CB_BASE_DELAY_MS").ok(),
                1000,
                100,
                u32::MAX,
            )?,
            cb_backoff_mult: f32_in(
                "CB_BACKOFF_MULT",
                env::var("CB_BACKOFF_MULT").ok(),
                2.0,
                1.0,
                5.0,
            )?,
            cb_max_backoff_ms: u32_in(
                "CB_MAX_BACKOFF_MS",
                env::var("CB_MAX_BACKOFF_MS").ok(),
                10_000,
                1000,
                u32::MAX,
            )?,
            pagination_max_limit: u32_in(
                "PAGINATION_MAX_LIMIT",
                env::var("PAGINATION_MAX_LIMIT").ok(),
                1000,
                1,
                u32::MAX,
            )?,
            job_timeout_ms: u64_min(
                "JOB_TIMEOUT_MS",
                env::var("JOB_TIMEOUT_MS").ok(),
                300_000,
                1000,
            )?,
            shutdown_grace_ms: u64_min(
                "SHUTDOWN_GRACE_MS",
                env::var("SHUTDOWN_GRACE_MS").ok(),
                30_000,
                0,
            )?,
            secrets_url: env::var("SECRETS_URL").ok(),
            secrets_token: env::var("SECRETS_TOKEN").ok(),
        })
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn port(key: &'static str, raw: Option<String>, default: u16) -> Result<u16, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse::<u16>().map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("`{value}` is not a valid port"),
        }),
    }
}

fn u32_in(
    key: &'static str,
    raw: Option<String>,
    default: u32,
    min: u32,
    max: u32,
) -> Result<u32, ConfigError> {
    let value = match raw {
        None => return Ok(default),
        Some(value) => value.parse::<u32>().map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("`{value}` is not a valid integer"),
        })?,
    };
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            key,
            value: value.to_string(),
            min: min.to_string(),
            max: if max == u32::MAX {
                "unbounded".to_string()
            } else {
                max.to_string()
            },
        });
    }
    Ok(value)
}

fn u64_min(
    key: &'static str,
    raw: Option<String>,
    default: u64,
    min: u64,
) -> Result<u64, ConfigError> {
    let value = match raw {
        None => return Ok(default),
        Some(value) => value.parse::<u64>().map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("`{value}` is not a valid integer"),
        })?,
    };
    if value < min {
        return Err(ConfigError::OutOfRange {
            key,
            value: value.to_string(),
            min: min.to_string(),
            max: "unbounded".to_string(),
        });
    }
    Ok(value)
}

fn f32_in(
    key: &'static str,
    raw: Option<String>,
    default: f32,
    min: f32,
    max: f32,
) -> Result<f32, ConfigError> {
    let value = match raw {
        None => return Ok(default),
        Some(value) => value.parse::<f32>().map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("`{value}` is not a valid number"),
        })?,
    };
    if !value.is_finite() || value < min || value > max {
        return Err(ConfigError::OutOfRange {
            key,
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        });
    }
    Ok(value)
}

fn boolean(key: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref() {
        None => Ok(default),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(value) => Err(ConfigError::Invalid {
            key,
            reason: format!("`{value}` is not a boolean (expected true/false/1/0)"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_in_uses_default_when_unset() {
        assert_eq!(u32_in("MAX_CONCURRENT", None, 5, 1, 50).unwrap(), 5);
    }

    #[test]
    fn u32_in_parses_value() {
        assert_eq!(
            u32_in("MAX_CONCURRENT", Some("12".to_string()), 5, 1, 50).unwrap(),
            12
        );
    }

    #[test]
    fn u32_in_rejects_out_of_range() {
        let err = u32_in("MAX_CONCURRENT", Some("51".to_string()), 5, 1, 50).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }

    #[test]
    fn u32_in_rejects_garbage() {
        let err = u32_in("MAX_CONCURRENT", Some("many".to_string()), 5, 1, 50).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn f32_in_rejects_nan() {
        let err = f32_in("CB_BACKOFF_MULT", Some("NaN".to_string()), 2.0, 1.0, 5.0).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }

    #[test]
    fn f32_in_accepts_bounds() {
        assert_eq!(
            f32_in("CB_BACKOFF_MULT", Some("1.0".to_string()), 2.0, 1.0, 5.0).unwrap(),
            1.0
        );
        assert_eq!(
            f32_in("CB_BACKOFF_MULT", Some("5.0".to_string()), 2.0, 1.0, 5.0).unwrap(),
            5.0
        );
    }

    #[test]
    fn boolean_parses_common_forms() {
        assert!(boolean("X", Some("true".to_string()), false).unwrap());
        assert!(boolean("X", Some("1".to_string()), false).unwrap());
        assert!(!boolean("X", Some("false".to_string()), true).unwrap());
        assert!(boolean("X", None, true).unwrap());
    }

    #[test]
    fn boolean_rejects_garbage() {
        assert!(boolean("X", Some("yep".to_string()), false).is_err());
    }

    #[test]
    fn port_rejects_non_numeric() {
        assert!(port("API_PORT", Some("eighty".to_string()), 8080).is_err());
    }
}
