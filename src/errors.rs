//! Error types.

use diesel::result::DatabaseErrorKind;
use tokio::time::Duration;

#[doc(no_inline)]
pub use diesel::result::{ConnectionError, Error as DieselError};
#[doc(no_inline)]
pub use diesel_async::pooled_connection::deadpool::{BuildError, PoolError};

use crate::notifier::Topic;
use crate::SourceId;

/// Download sources database related errors.
#[derive(thiserror::Error, Debug)]
pub enum DatabaseError {
    #[error("connection failed: {0}")]
    ConnectionError(#[from] ConnectionError),

    #[error("migration failed: {0}")]
    MigrationError(String),

    #[error(transparent)]
    DieselError(#[from] DieselError),

    #[error("failed to get connection from pool: {0}")]
    PoolError(#[from] PoolError),

    #[error("failed to build connection pool: {0}")]
    BuildError(#[from] BuildError),

    #[error("download count {0} does not fit into the database")]
    DownloadCountOutOfRange(u64),
}

impl DatabaseError {
    /// Whether the error is unique key violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            *self,
            DatabaseError::DieselError(DieselError::DatabaseError(
                DatabaseErrorKind::UniqueViolation,
                _
            ))
        )
    }

    /// Whether the error is caused by missing row.
    pub fn is_not_found(&self) -> bool {
        matches!(*self, DatabaseError::DieselError(DieselError::NotFound))
    }
}

/// Remote synchronization errors.
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("HTTP response status code {0}")]
    UnexpectedStatus(u16),

    #[error("invalid catalog: {0}")]
    InvalidCatalog(#[from] serde_json::Error),

    #[error("catalog exceeds {limit} bytes")]
    CatalogTooLarge { limit: usize },

    #[error("{0}")]
    CustomError(String),
}

/// Completion notification errors.
#[derive(thiserror::Error, Debug)]
pub enum NotifyError {
    #[error("topic '{0}' already has a subscriber")]
    TopicBusy(Topic),

    #[error("no completion received on '{topic}' within {after:?}")]
    TimedOut { topic: Topic, after: Duration },

    #[error("completion channel '{0}' closed without message")]
    Closed(Topic),
}

/// Download sources manager error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("synchronization failed: {0}")]
    SyncError(#[from] SyncError),

    #[error("completion notification failed: {0}")]
    NotifyError(#[from] NotifyError),

    #[error("operation '{topic}' failed: {reason}")]
    OperationFailed { topic: Topic, reason: String },

    #[error("synchronization is already in progress")]
    SyncInProgress,

    #[error("removal of source {0} is already in progress")]
    RemovalInProgress(SourceId),

    #[error("source with URL '{0}' already exists")]
    SourceAlreadyExists(String),
}

impl From<PoolError> for Error {
    fn from(value: PoolError) -> Self {
        Self::DatabaseError(value.into())
    }
}

/// Non UTF-8 symbol in path.
#[derive(thiserror::Error, Debug)]
#[error("non-UTF-8 symbol in path")]
pub struct NonUtf8PathError;
