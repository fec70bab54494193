//! Store error types.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// Another transaction won a race on the same rows.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// A stored value does not decode into its typed form.
    #[error("corrupt {table} row: {message}")]
    Decode {
        table: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub(crate) fn decode(table: &'static str, message: impl std::fmt::Display) -> Self {
        StoreError::Decode {
            table,
            message: message.to_string(),
        }
    }
}

/// Postgres error codes that mean "lost a race, try again".
const CONFLICT_CODES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "23505", // unique_violation
];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            if let Some(code) = db_err.code() {
                if CONFLICT_CODES.contains(&code.as_ref()) {
                    return StoreError::Conflict(db_err.message().to_string());
                }
            }
        }
        StoreError::Query(err)
    }
}
