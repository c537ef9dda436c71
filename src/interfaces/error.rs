use std::time::Duration;

use thiserror::Error;

use crate::lock::LockKey;

/// Errors raised while opening, provisioning or closing an outbox store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection could not be obtained, or its context not resolved.
    #[error("Connection error: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("No database name")]
    NoDatabaseName,

    #[error("No schema")]
    NoSchema,

    /// Re-entrant acquire on a session that already holds its lock.
    #[error("Lock already held by this session: key={key}")]
    AlreadyLocked { key: LockKey },

    #[error("Try lock failed: key={key}: {source}")]
    LockAcquire {
        key: LockKey,
        #[source]
        source: sqlx::Error,
    },

    #[error("Try lock failed: key={key}: timed out after {timeout:?}")]
    LockTimeout { key: LockKey, timeout: Duration },

    /// An earlier acquire was dropped before it finished; the connection may
    /// still be granted the lock and has to be discarded.
    #[error("Lock acquire abandoned: key={key}: discard the connection")]
    AcquireAbandoned { key: LockKey },

    #[error("Failed to ensure table {schema}.{table}: {source}")]
    SchemaInit {
        schema: String,
        table: String,
        #[source]
        source: sqlx::Error,
    },

    /// The unlock call failed; the lock may still be held server side.
    #[error("Failed to release lock: key={key}: {source}")]
    LockRelease {
        key: LockKey,
        #[source]
        source: sqlx::Error,
    },

    /// The guarded operation failed and the follow-up unlock failed too.
    ///
    /// `source` is the primary failure.
    #[error("Failed to unlock table after error: {source}; unlock error: {release}")]
    UnlockAfterFailure {
        #[source]
        source: Box<StoreError>,
        release: Box<StoreError>,
    },

    #[error("Failed to close connection: {0}")]
    Close(#[source] sqlx::Error),
}

impl StoreError {
    /// Whether this error leaves the advisory lock possibly held.
    ///
    /// Sessions that own the connection free it by closing; otherwise an
    /// operator has to step in.
    pub fn is_leaked_lock(&self) -> bool {
        matches!(
            self,
            StoreError::LockRelease { .. }
                | StoreError::UnlockAfterFailure { .. }
                | StoreError::AcquireAbandoned { .. }
        )
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
