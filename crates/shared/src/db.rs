//! Database pool and migration helpers

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::{str::FromStr, time::Duration};

/// Create the shared connection pool.
///
/// Statement caching is disabled for PgBouncer transaction-mode
/// compatibility, and the connection cap is kept low so the API, the worker,
/// and ad-hoc script runs together stay under the upstream pooler's session
/// limit.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

    PgPoolOptions::new()
        .max_connections(3)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(60))
        .max_lifetime(Duration::from_secs(300))
        .connect_with(options)
        .await
}

/// Apply the workspace migrations. Every binary runs this at startup;
/// migrations are idempotent so concurrent starts are safe.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}
