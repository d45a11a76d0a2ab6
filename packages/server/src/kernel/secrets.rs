//! Secret provider with a circuit breaker over the external secret source.
//!
//! The provider wraps a [`SecretSource`] capability. Repeated upstream
//! failures open the circuit: requests are then served from the cached
//! snapshot, fail fast instead of hammering the source, and a probe is let
//! through once the cooldown elapses. Upstream errors never propagate past
//! this facade except as [`SecretError::Unavailable`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;

/// Cached snapshots older than this are served with a `stale` marker.
const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Upstream attempts per closed-state refresh (with backoff between them).
const UPSTREAM_ATTEMPTS: u32 = 3;

pub type SecretMap = HashMap<String, String>;

/// The external capability: fetch the full secret map.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch(&self) -> Result<SecretMap>;
}

/// HTTP secret source (vault-style endpoint returning a flat JSON map).
pub struct HttpSecretSource {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpSecretSource {
    pub fn new(url: String, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self { url, token, client })
    }
}

#[async_trait]
impl SecretSource for HttpSecretSource {
    async fn fetch(&self) -> Result<SecretMap> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .context("failed to reach secret source")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("secret source error {}: {}", status, body);
        }

        response
            .json::<SecretMap>()
            .await
            .context("secret source returned an invalid payload")
    }
}

/// Fallback source reading `SECRET_*` variables from the process
/// environment.
pub struct EnvSecretSource {
    prefix: String,
}

impl EnvSecretSource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl SecretSource for EnvSecretSource {
    async fn fetch(&self) -> Result<SecretMap> {
        Ok(std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix(&self.prefix)
                    .map(|stripped| (stripped.to_string(), value))
            })
            .collect())
    }
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret source unavailable")]
    Unavailable,

    #[error("secret `{key}` not found")]
    Missing { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit-breaker thresholds, resolved from global config.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown: Duration,
    pub base_delay: Duration,
    pub backoff_mult: f32,
    pub max_backoff: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            cooldown: Duration::from_millis(5000),
            base_delay: Duration::from_millis(1000),
            backoff_mult: 2.0,
            max_backoff: Duration::from_millis(10_000),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            failure_threshold: config.cb_failure_threshold,
            success_threshold: config.cb_success_threshold,
            cooldown: Duration::from_millis(u64::from(config.cb_cooldown_ms)),
            base_delay: Duration::from_millis(u64::from(config.cb_base_delay_ms)),
            backoff_mult: config.cb_backoff_mult,
            max_backoff: Duration::from_millis(u64::from(config.cb_max_backoff_ms)),
        }
    }
}

/// Health view exposed by `/api/health/secrets`.
#[derive(Debug, Clone, Serialize)]
pub struct SecretHealth {
    pub state: CircuitState,
    pub healthy: bool,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_ms: Option<u64>,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    probe_in_flight: bool,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            last_success_at: None,
            last_error: None,
            probe_in_flight: false,
        }
    }
}

struct Snapshot {
    values: SecretMap,
    fetched_at: DateTime<Utc>,
}

pub struct SecretProvider {
    source: Arc<dyn SecretSource>,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    cache: RwLock<Option<Snapshot>>,
}

enum Gate {
    /// Call upstream (with internal retries in closed state).
    Fetch { probe: bool },
    /// Serve from cache only.
    Skip,
}

impl SecretProvider {
    pub fn new(source: Arc<dyn SecretSource>, config: CircuitBreakerConfig) -> Self {
        Self {
            source,
            config,
            state: Mutex::new(BreakerState::default()),
            cache: RwLock::new(None),
        }
    }

    /// Resolve a secret by key.
    ///
    /// Upstream failures are absorbed: the cached snapshot is served while
    /// the circuit is open, and only a missing cache yields
    /// [`SecretError::Unavailable`].
    pub async fn get(&self, key: &str) -> Result<String, SecretError> {
        self.refresh_if_allowed().await;

        let cache = self.cache.read().await;
        match cache.as_ref() {
            Some(snapshot) => snapshot
                .values
                .get(key)
                .cloned()
                .ok_or_else(|| SecretError::Missing {
                    key: key.to_string(),
                }),
            None => Err(SecretError::Unavailable),
        }
    }

    pub async fn health(&self) -> SecretHealth {
        let state = self.state.lock().await;
        let cache = self.cache.read().await;

        let cache_age_ms = cache.as_ref().map(|snapshot| {
            (Utc::now() - snapshot.fetched_at)
                .num_milliseconds()
                .max(0) as u64
        });
        let stale = cache_age_ms
            .map(|age| age > STALE_AFTER.as_millis() as u64)
            .unwrap_or(false);
        let next_retry_at = match state.state {
            CircuitState::Open => state.opened_at.map(|opened| {
                opened + chrono::Duration::milliseconds(self.config.cooldown.as_millis() as i64)
            }),
            _ => None,
        };

        SecretHealth {
            state: state.state,
            healthy: state.state == CircuitState::Closed,
            consecutive_failures: state.consecutive_failures,
            cache_age_ms,
            stale,
            last_error: state.last_error.clone(),
            next_retry_at,
        }
    }

    /// Decide under the lock, fetch off the lock.
    async fn refresh_if_allowed(&self) {
        let gate = {
            let mut state = self.state.lock().await;
            match state.state {
                CircuitState::Closed => Gate::Fetch { probe: false },
                CircuitState::Open => {
                    let cooled_down = state.opened_at.map_or(true, |opened| {
                        Utc::now()
                            >= opened
                                + chrono::Duration::milliseconds(
                                    self.config.cooldown.as_millis() as i64
                                )
                    });
                    if cooled_down && !state.probe_in_flight {
                        debug!("secret circuit cooling down complete; transitioning to half-open");
                        state.state = CircuitState::HalfOpen;
                        state.half_open_successes = 0;
                        state.probe_in_flight = true;
                        Gate::Fetch { probe: true }
                    } else {
                        Gate::Skip
                    }
                }
                CircuitState::HalfOpen => {
                    if state.probe_in_flight {
                        Gate::Skip
                    } else {
                        state.probe_in_flight = true;
                        Gate::Fetch { probe: true }
                    }
                }
            }
        };

        let probe = match gate {
            Gate::Skip => return,
            Gate::Fetch { probe } => probe,
        };

        let attempts = if probe { 1 } else { UPSTREAM_ATTEMPTS };
        let result = self.fetch_with_backoff(attempts).await;

        match result {
            Ok(values) => {
                *self.cache.write().await = Some(Snapshot {
                    values,
                    fetched_at: Utc::now(),
                });
                let mut state = self.state.lock().await;
                state.probe_in_flight = false;
                state.last_success_at = Some(Utc::now());
                state.last_error = None;
                match state.state {
                    CircuitState::HalfOpen => {
                        state.half_open_successes += 1;
                        if state.half_open_successes >= self.config.success_threshold {
                            info!("secret source recovered; circuit closed");
                            state.state = CircuitState::Closed;
                            state.consecutive_failures = 0;
                            state.half_open_successes = 0;
                            state.opened_at = None;
                        }
                    }
                    _ => {
                        state.consecutive_failures = 0;
                    }
                }
            }
            Err(fetch_error) => {
                let mut state = self.state.lock().await;
                state.probe_in_flight = false;
                state.last_error = Some(format!("{fetch_error:#}"));
                match state.state {
                    CircuitState::HalfOpen => {
                        warn!(error = %fetch_error, "secret probe failed; circuit re-opened");
                        state.state = CircuitState::Open;
                        state.opened_at = Some(Utc::now());
                        state.half_open_successes = 0;
                    }
                    CircuitState::Closed => {
                        state.consecutive_failures += 1;
                        if state.consecutive_failures >= self.config.failure_threshold {
                            error!(
                                consecutive_failures = state.consecutive_failures,
                                error = %fetch_error,
                                "secret source failing; circuit opened"
                            );
                            state.state = CircuitState::Open;
                            state.opened_at = Some(Utc::now());
                        } else {
                            warn!(
                                consecutive_failures = state.consecutive_failures,
                                error = %fetch_error,
                                "secret fetch failed"
                            );
                        }
                    }
                    CircuitState::Open => {}
                }
            }
        }
    }

    async fn fetch_with_backoff(&self, attempts: u32) -> Result<SecretMap> {
        let mut delay = self.config.base_delay;
        let mut last_error = None;

        for attempt in 1..=attempts.max(1) {
            match self.source.fetch().await {
                Ok(values) => return Ok(values),
                Err(fetch_error) => {
                    last_error = Some(fetch_error);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        let next = delay.as_secs_f64() * f64::from(self.config.backoff_mult);
                        delay = Duration::from_secs_f64(
                            next.min(self.config.max_backoff.as_secs_f64()),
                        );
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("secret fetch failed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FlakySource {
        healthy: AtomicBool,
        calls: AtomicU32,
    }

    impl FlakySource {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                calls: AtomicU32::new(0),
            })
        }

        fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SecretSource for FlakySource {
        async fn fetch(&self) -> Result<SecretMap> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                let mut map = SecretMap::new();
                map.insert("API_KEY".to_string(), "s3cr3t".to_string());
                Ok(map)
            } else {
                bail!("connection refused")
            }
        }
    }

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            cooldown: Duration::from_millis(50),
            base_delay: Duration::from_millis(1),
            backoff_mult: 2.0,
            max_backoff: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn healthy_source_serves_secrets() {
        let source = FlakySource::new(true);
        let provider = SecretProvider::new(source.clone(), fast_config());

        assert_eq!(provider.get("API_KEY").await.unwrap(), "s3cr3t");
        let health = provider.health().await;
        assert!(health.healthy);
        assert_eq!(health.state, CircuitState::Closed);
        assert!(!health.stale);
    }

    #[tokio::test]
    async fn missing_key_is_not_an_outage() {
        let provider = SecretProvider::new(FlakySource::new(true), fast_config());
        assert!(matches!(
            provider.get("NOPE").await,
            Err(SecretError::Missing { .. })
        ));
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_failures() {
        let source = FlakySource::new(false);
        let provider = SecretProvider::new(source.clone(), fast_config());

        for _ in 0..3 {
            let _ = provider.get("API_KEY").await;
        }

        let health = provider.health().await;
        assert_eq!(health.state, CircuitState::Open);
        assert!(!health.healthy);
        assert!(health.next_retry_at.is_some());

        // No cache yet: unavailable.
        assert!(matches!(
            provider.get("API_KEY").await,
            Err(SecretError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn open_circuit_serves_cache_without_calling_upstream() {
        let source = FlakySource::new(true);
        let provider = SecretProvider::new(source.clone(), fast_config());

        // Warm the cache, then break the source and open the circuit.
        provider.get("API_KEY").await.unwrap();
        source.set_healthy(false);
        for _ in 0..3 {
            let _ = provider.get("API_KEY").await;
        }
        assert_eq!(provider.health().await.state, CircuitState::Open);

        let calls_before = source.calls();
        // Within the cooldown: served from cache, upstream untouched.
        assert_eq!(provider.get("API_KEY").await.unwrap(), "s3cr3t");
        assert_eq!(source.calls(), calls_before);
    }

    #[tokio::test]
    async fn circuit_recovers_after_successful_probes() {
        let source = FlakySource::new(false);
        let provider = SecretProvider::new(source.clone(), fast_config());

        for _ in 0..3 {
            let _ = provider.get("API_KEY").await;
        }
        assert_eq!(provider.health().await.state, CircuitState::Open);

        source.set_healthy(true);
        tokio::time::sleep(Duration::from_millis(60)).await;

        // First probe succeeds -> still half-open (success_threshold = 2).
        provider.get("API_KEY").await.unwrap();
        assert_eq!(provider.health().await.state, CircuitState::HalfOpen);

        // Second success closes the circuit and resets the failure count.
        provider.get("API_KEY").await.unwrap();
        let health = provider.health().await;
        assert_eq!(health.state, CircuitState::Closed);
        assert!(health.healthy);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn failed_probe_reopens_the_circuit() {
        let source = FlakySource::new(false);
        let provider = SecretProvider::new(source.clone(), fast_config());

        for _ in 0..3 {
            let _ = provider.get("API_KEY").await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Probe runs (source still down) -> back to open with a fresh cooldown.
        let _ = provider.get("API_KEY").await;
        let health = provider.health().await;
        assert_eq!(health.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn env_source_reads_prefixed_variables() {
        std::env::set_var("ALEPH_TEST_SECRET_FOO", "bar");
        let source = EnvSecretSource::new("ALEPH_TEST_SECRET_");
        let map = source.fetch().await.unwrap();
        assert_eq!(map.get("FOO").map(String::as_str), Some("bar"));
        std::env::remove_var("ALEPH_TEST_SECRET_FOO");
    }
}
