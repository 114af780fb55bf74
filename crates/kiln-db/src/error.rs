//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    /// Classify a failed insert: unique violations become `Duplicate`.
    pub(crate) fn on_insert(err: sqlx::Error, what: impl Into<String>) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => DbError::Duplicate(what.into()),
            _ => DbError::Database(err),
        }
    }
}

impl From<kiln_core::Error> for DbError {
    fn from(err: kiln_core::Error) -> Self {
        DbError::Corrupt(err.to_string())
    }
}

impl From<DbError> for kiln_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => kiln_core::Error::NotFound(msg),
            DbError::Duplicate(msg) => kiln_core::Error::Conflict(msg),
            DbError::Database(e) => kiln_core::Error::Unavailable(e.to_string()),
            DbError::Corrupt(msg) => kiln_core::Error::Internal(msg),
            DbError::Migration(e) => kiln_core::Error::Internal(e.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
