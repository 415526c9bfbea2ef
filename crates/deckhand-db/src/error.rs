//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A stored value could not be turned back into a domain type.
    #[error("corrupt row: {0}")]
    Decode(String),

    /// The write was refused by a domain rule checked inside a transaction.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    /// Map a unique-violation (SQLSTATE 23505) to [`DbError::Duplicate`].
    pub(crate) fn unique(err: sqlx::Error, what: impl FnOnce() -> String) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => DbError::Duplicate(what()),
            _ => DbError::Database(err),
        }
    }
}

impl From<DbError> for deckhand_core::Error {
    fn from(err: DbError) -> Self {
        use deckhand_core::Error;
        match err {
            DbError::NotFound(what) => Error::NotFound(what),
            DbError::Duplicate(what) => Error::Conflict(what),
            DbError::Rejected(why) => Error::InvalidInput(why),
            other => Error::Internal(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Parse a stored enum column.
pub(crate) fn decode<T>(column: &str, raw: &str) -> DbResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| DbError::Decode(format!("{column}: {e}")))
}
