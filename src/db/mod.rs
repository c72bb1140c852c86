pub mod pool;
pub mod repository;
pub mod sqlite;

pub use pool::*;
pub use repository::*;
pub use sqlite::*;

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },
}

/// Errors surfaced by the `CaseRepository` contract.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// A concurrent writer got there first. Callers treat this as "already processed".
    #[error("Conflicting write: {0}")]
    Conflict(String),

    /// Pool exhausted, database busy or locked. Retryable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl PersistenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistenceError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                PersistenceError::Unavailable(e.to_string())
            }
            Some(ErrorCode::ConstraintViolation) => PersistenceError::Conflict(e.to_string()),
            _ => PersistenceError::Database(DatabaseError::Sqlite(e)),
        }
    }
}
