//! Backend-specific error type for the Postgres cold store adapter,
//! converted into [`leaflet_cep::Error`] at the
//! [`ColdStore`][leaflet_cep::ColdStore] trait boundary.

use leaflet_cep::Error;

/// Postgres error code for a unique-constraint violation: the signal for
/// a benign archival-checkpoint race (I5) rather than a real failure.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("failed to decode row column `{0}`")]
    Column(&'static str),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migration(err)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::Database(sqlx_err) if is_unique_violation(sqlx_err) => {
                // I5: callers should never observe this as a failure; adapters
                // that can detect the collision earlier return `Ok(false)`
                // from `try_mark_archived` instead of reaching this arm.
                Error::Permanent(anyhow::Error::new(err))
            }
            StoreError::Database(sqlx_err) if is_transient(sqlx_err) => {
                Error::Transient(anyhow::Error::new(err))
            }
            StoreError::Database(_) | StoreError::Column(_) => Error::Permanent(anyhow::Error::new(err)),
            StoreError::Migration(_) => Error::Config(err.to_string()),
        }
    }
}

/// True for connection-level failures expected to clear up on retry.
fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    )
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(sqlx::error::DatabaseError::code)
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}
