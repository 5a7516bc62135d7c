use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Connect to PostgreSQL and apply the dead-letter / device-token migrations.
///
/// Only DLQ appends and token updates use the pool; delivery never does.
pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    sqlx::migrate!("../../migrations").run(&pool).await?;

    tracing::info!(max_connections, "Connected to PostgreSQL, migrations applied");
    Ok(pool)
}
