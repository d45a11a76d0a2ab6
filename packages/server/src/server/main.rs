// Main entry point for the AlephAuto core server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aleph_core::kernel::event_hub::EventHub;
use aleph_core::kernel::jobs::{
    EchoWorker, ExecutorOptions, JobRepository, JobStore, MemoryJobStore, PostgresJobStore, Worker,
    WorkerDescriptor, WorkerRegistry,
};
use aleph_core::kernel::secrets::{
    CircuitBreakerConfig, EnvSecretSource, HttpSecretSource, SecretProvider, SecretSource,
};
use aleph_core::server::{build_router, AppState};
use aleph_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,aleph_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting AlephAuto core server");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Select the job store
    let store: Arc<dyn JobStore> = if config.database_url == "memory:" {
        tracing::warn!("DATABASE_URL=memory: — using the in-memory job store");
        Arc::new(MemoryJobStore::new())
    } else {
        tracing::info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("Failed to connect to database")?;
        tracing::info!("Database connected");

        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
        tracing::info!("Migrations complete");

        Arc::new(PostgresJobStore::new(pool))
    };

    // Repository with background degraded-mode recovery
    let repository = Arc::new(JobRepository::new(store, config.pagination_max_limit));
    let background = CancellationToken::new();
    let recovery = JobRepository::spawn_recovery(repository.clone(), background.clone());

    // Event fan-out
    let events = EventHub::new();

    // Secret provider behind the circuit breaker
    let source: Arc<dyn SecretSource> = match &config.secrets_url {
        Some(url) => Arc::new(
            HttpSecretSource::new(url.clone(), config.secrets_token.clone())
                .context("Failed to build secret source")?,
        ),
        None => Arc::new(EnvSecretSource::new("SECRET_")),
    };
    let secrets = Arc::new(SecretProvider::new(
        source,
        CircuitBreakerConfig::from_config(&config),
    ));

    // Pipeline registrations (static; no runtime mutation)
    let mut registry = WorkerRegistry::new(
        repository.clone(),
        events.clone(),
        ExecutorOptions::from_config(&config),
    );
    registry.register(WorkerDescriptor::new("echo", "Echo", || async {
        Ok(Arc::new(EchoWorker) as Arc<dyn Worker>)
    }));
    let registry = Arc::new(registry);

    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        repository: repository.clone(),
        events,
        secrets,
    };
    let app = build_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.api_port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.api_port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Graceful teardown: stop executors, then release background tasks and
    // flush the degraded write queue best-effort.
    tracing::info!("Shutting down executors");
    registry.shutdown_all(config.shutdown_grace()).await;
    background.cancel();
    repository.flush_best_effort().await;
    if tokio::time::timeout(Duration::from_secs(5), recovery)
        .await
        .is_err()
    {
        tracing::warn!("recovery task did not stop within 5s");
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received shutdown signal");
}
