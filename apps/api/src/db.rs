use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Connections kept for HTTP handlers on top of one per worker slot.
const HTTP_CONNECTIONS: u32 = 5;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects a pool sized for `worker_slots` concurrent pipeline attempts.
///
/// A bounded acquire keeps a saturated database from stalling a worker
/// forever; the pipeline treats the resulting error as an infrastructure
/// failure and requeues.
pub async fn create_pool(database_url: &str, worker_slots: usize) -> Result<PgPool> {
    let max_connections = u32::try_from(worker_slots)
        .unwrap_or(u32::MAX)
        .saturating_add(HTTP_CONNECTIONS);
    info!(max_connections, "Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await
        .context("Failed to connect to DATABASE_URL")?;

    info!("PostgreSQL connection pool established");
    Ok(pool)
}

/// Applies the bundled migrations. Idempotent.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to apply migrations")?;
    info!("Database migrations applied");
    Ok(())
}
