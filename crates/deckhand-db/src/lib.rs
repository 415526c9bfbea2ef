//! Database layer for the deckhand CD trigger core.
//!
//! Provides repository traits and PostgreSQL implementations for pipelines,
//! artifacts, workflows and runners, timelines, release overrides, release
//! configuration, audit history and custom tags, plus Postgres-backed
//! implementations of the supporting lookup services.

pub mod error;
pub mod repo;
pub mod services;

pub use error::{DbError, DbResult};
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
