//! PostgreSQL infrastructure adapters implementing the database ports.

pub mod repositories;

pub use repositories::live_records::PostgresLiveRecordRepository;
pub use repositories::manifest::PostgresManifestRepository;
pub use repositories::sync_runs::PostgresSyncRunRepository;

use sqlx::PgPool;
use tracing::info;

use crate::error::SyncError;

/// Embedded schema migrations for every table the engine touches.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Applies pending migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), SyncError> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| SyncError::Store(format!("migrations failed: {e}")))?;
    info!("Database migrations are up to date");
    Ok(())
}

/// Maps a sqlx error into a store error tagged with the failing operation.
pub(crate) fn store_err(
    op: &'static str,
) -> impl Fn(sqlx::Error) -> SyncError {
    move |e| SyncError::Store(format!("{op} failed: {e}"))
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505")
        }
        _ => false,
    }
}

pub(crate) async fn health_check(
    pool: &PgPool,
    component: &str,
) -> Result<(), SyncError> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| {
            SyncError::Store(format!(
                "{component} failed Postgres health check: {e}"
            ))
        })?;
    Ok(())
}
