//! Postgres persistence for the pipeline: runs, files, POIs, relationships,
//! evidence, and the transactional outbox. Every write here is a plain SQL
//! statement against connection-pooled `PgPool` — no ORM, no query builder.

use anyhow::Context;
use ctp_errors::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub mod batched_writer;
pub mod evidence;
pub mod files;
pub mod outbox;
pub mod pois;
pub mod queue;
pub mod relationships;
pub mod retention;
pub mod runs;
pub mod types;

pub use batched_writer::BatchedWriter;
pub use types::*;

pub const ENV_DB_URL: &str = "CTP_DATABASE_URL";

/// Connect to Postgres using `CTP_DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .with_context(|| format!("missing env var {ENV_DB_URL}"))
        .map_err(|e| ctp_errors::CtpError::wrap(ctp_errors::ErrorKind::InternalBug, e))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")
        .map_err(|e| ctp_errors::CtpError::wrap(ctp_errors::ErrorKind::TransientIo, e))?;

    Ok(pool)
}

/// Connect and immediately apply any pending migrations. Used by tests and
/// by the daemon's startup sequence.
#[cfg(feature = "testkit")]
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run the embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")
        .map_err(|e| ctp_errors::CtpError::wrap(ctp_errors::ErrorKind::TransientIo, e))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_runs_table: bool,
}

/// Simple status query: connectivity plus schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")
        .map_err(|e| ctp_errors::CtpError::wrap(ctp_errors::ErrorKind::TransientIo, e))?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from information_schema.tables
            where table_schema = 'public' and table_name = 'files'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")
    .map_err(|e| ctp_errors::CtpError::wrap(ctp_errors::ErrorKind::TransientIo, e))?;

    Ok(DbStatus {
        ok: one == 1,
        has_runs_table: exists,
    })
}

/// List applied migrations from the `schema_migrations` view.
pub async fn list_migrations(pool: &PgPool) -> Result<Vec<SchemaMigrationRow>> {
    let rows = sqlx::query_as::<_, (i64, String, chrono::DateTime<chrono::Utc>)>(
        "select version, description, applied_at from schema_migrations order by version asc",
    )
    .fetch_all(pool)
    .await
    .context("list_migrations failed")
    .map_err(|e| ctp_errors::CtpError::wrap(ctp_errors::ErrorKind::TransientIo, e))?;

    Ok(rows
        .into_iter()
        .map(|(version, description, applied_at)| SchemaMigrationRow {
            version,
            description,
            applied_at,
        })
        .collect())
}

pub(crate) fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(c) = db_err.constraint() {
            return c == constraint;
        }
    }
    false
}
