mod config;
mod customize;
mod db;
mod errors;
mod extract;
mod llm_client;
mod models;
mod pipeline;
mod queue;
mod records;
mod render;
mod resumes;
mod routes;
mod state;
mod storage;
mod worker;

#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::customize::LlmCustomizer;
use crate::db::{create_pool, run_migrations};
use crate::extract::DocumentExtractor;
use crate::llm_client::LlmClient;
use crate::pipeline::{Backoff, Collaborators, Pipeline, PipelineSettings};
use crate::queue::{RedisJobQueue, RedisResumeLocks};
use crate::records::PgResumeStore;
use crate::render::HeadlessRenderer;
use crate::routes::build_router;
use crate::state::AppState;
use crate::storage::S3ArtifactStore;
use crate::worker::{PoolHealth, WorkerPool, WorkerSettings};

/// Render failures are retried this many times within one attempt.
const RENDER_RETRIES: u32 = 1;
/// Idle poll interval of each worker slot.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Tailor v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url, config.worker_pool_size).await?;
    run_migrations(&db).await?;
    let records = Arc::new(PgResumeStore::new(db));

    // Initialize Redis queue and resume locks
    let redis = redis::Client::open(config.redis_url.clone())?;
    let queue = Arc::new(RedisJobQueue::new(redis.clone(), &config.queue_name));
    let locks = Arc::new(RedisResumeLocks::new(redis, &config.queue_name));
    info!("Redis queue initialized (queue: {})", config.queue_name);

    // Initialize S3 / MinIO
    let artifacts = Arc::new(S3ArtifactStore::from_config(&config).await);

    // Initialize LLM client. The transport timeout is only a backstop for the
    // pipeline's own customization timeout.
    let llm = LlmClient::new(
        config.anthropic_api_key.clone(),
        config.customization_endpoint.clone(),
        config.customization_timeout * 2,
    )?;
    info!("LLM client initialized (model: {})", llm_client::MODEL);

    let renderer = HeadlessRenderer::from_command_line(&config.render_command, config.render_timeout)
        .context("RENDER_COMMAND must name a program")?;

    let backoff = Backoff::new(config.retry_backoff_base, config.retry_backoff_max);
    let pipeline = Arc::new(Pipeline::new(
        Collaborators {
            records: records.clone(),
            artifacts: artifacts.clone(),
            extractor: Arc::new(DocumentExtractor),
            customizer: Arc::new(LlmCustomizer::new(llm)),
            renderer: Arc::new(renderer),
            locks,
        },
        PipelineSettings {
            customization_timeout: config.customization_timeout,
            max_retries: config.max_retries,
            render_retries: RENDER_RETRIES,
            backoff,
            lock_ttl: config.lease_timeout,
            busy_requeue_delay: config.retry_backoff_base,
        },
    ));

    // Start the worker pool
    let health = Arc::new(PoolHealth::default());
    let workers = WorkerPool::start(
        queue.clone(),
        pipeline,
        WorkerSettings {
            pool_size: config.worker_pool_size,
            lease: config.lease_timeout,
            poll_interval: POLL_INTERVAL,
            shutdown_grace: config.shutdown_grace,
            reconnect_backoff: backoff,
        },
        Arc::clone(&health),
    );

    // Build app state
    let state = AppState {
        records,
        artifacts,
        queue,
        workers: health,
        config: config.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    workers.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
