//! Postgres wiring shared by the persistent stores.
//!
//! Every store maps `sqlx` errors through [`classify`] so that a dropped
//! connection surfaces as a transient failure while constraint violations stay
//! visible to the caller as conflicts.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

const SCHEMA: &str = include_str!("../migrations/0001_creditflow.sql");

/// Connect a pool sized for one process.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(16)
        .connect(database_url)
        .await
}

/// Create missing tables and indexes (idempotent).
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("creditflow schema ensured");
    Ok(())
}

/// How a failed statement should be treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlFailure {
    /// Unique constraint hit (`23505`); usually a lost race.
    UniqueViolation(String),
    /// Check constraint hit (`23514`); the write would break an invariant.
    CheckViolation(String),
    /// Connectivity/pool/timeout problems; safe to retry.
    Unavailable(String),
    Other(String),
}

pub fn classify(operation: &str, err: sqlx::Error) -> SqlFailure {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => SqlFailure::UniqueViolation(msg),
                Some("23514") => SqlFailure::CheckViolation(msg),
                // serialization_failure / deadlock_detected
                Some("40001") | Some("40P01") => SqlFailure::Unavailable(msg),
                _ => SqlFailure::Other(msg),
            }
        }
        sqlx::Error::PoolClosed => SqlFailure::Unavailable(format!("connection pool closed in {operation}")),
        sqlx::Error::PoolTimedOut => SqlFailure::Unavailable(format!("connection pool timed out in {operation}")),
        sqlx::Error::Io(e) => SqlFailure::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => SqlFailure::Unavailable(format!("tls error in {operation}: {e}")),
        other => SqlFailure::Other(format!("sqlx error in {operation}: {other}")),
    }
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}
