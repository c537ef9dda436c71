//! Connection interfaces used by the schema-initialization protocol.

use std::time::Duration;

use async_trait::async_trait;

use crate::lock::LockKey;

/// A single, exclusively owned database session.
///
/// Every call takes `&mut self`: a connection is used sequentially by one
/// owner. Advisory locks taken through it are session scoped, so they are
/// released by the server when the connection goes away.
///
/// Implementations:
/// - `sqlx::PgConnection`: PostgreSQL
/// - `MockConnection`: in-memory database for tests
#[async_trait]
pub trait StoreConnection: Send {
    /// Name of the database this session is connected to.
    ///
    /// `None` or an empty string means the session has no usable database
    /// context.
    async fn current_database(&mut self) -> Result<Option<String>, sqlx::Error>;

    /// Name of the schema unqualified objects resolve to.
    async fn current_schema(&mut self) -> Result<Option<String>, sqlx::Error>;

    /// Take the exclusive session-scoped advisory lock for `key`.
    ///
    /// With no `timeout`, waits until the lock is granted. With a timeout the
    /// server bounds the wait and `Ok(false)` means the lock was not granted;
    /// a zero timeout makes a single attempt.
    ///
    /// Dropping the returned future does not withdraw a request the server
    /// has already queued: it may still be granted to this session later.
    /// A connection whose lock call was dropped must be discarded.
    async fn advisory_lock(
        &mut self,
        key: LockKey,
        timeout: Option<Duration>,
    ) -> Result<bool, sqlx::Error>;

    /// Release the session-scoped advisory lock for `key`.
    ///
    /// Returns `false` when the server reports that this session did not
    /// hold the lock.
    async fn advisory_unlock(&mut self, key: LockKey) -> Result<bool, sqlx::Error>;

    /// Whether a table named `table` exists in `schema`.
    async fn table_exists(&mut self, schema: &str, table: &str) -> Result<bool, sqlx::Error>;

    /// Execute a statement that returns no rows.
    async fn execute(&mut self, sql: &str) -> Result<(), sqlx::Error>;

    /// Execute `statements` in order inside one transaction.
    ///
    /// Either every statement takes effect or none does.
    async fn execute_transaction(&mut self, statements: &[String]) -> Result<(), sqlx::Error>;

    /// Close the session.
    async fn close(self) -> Result<(), sqlx::Error>
    where
        Self: Sized;
}

/// Supplies live, authenticated connections.
///
/// Authentication, pooling and reconnection belong to the provider; the
/// session only asks for one connection and keeps it.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    type Connection: StoreConnection;

    /// Obtain a connection the caller will own exclusively.
    async fn connect(&self) -> Result<Self::Connection, sqlx::Error>;
}
