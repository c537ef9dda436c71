//! Outbox store session.
//!
//! Opening a session resolves which database and schema the connection
//! points at and then provisions the event-store table under the schema's
//! advisory lock:
//!
//! ```text
//! connect -> current_database() -> current_schema()
//!         -> lock -> ensure table -> unlock (always)
//! ```
//!
//! Any number of processes may open sessions concurrently; the database's
//! lock manager lets exactly one of them create the table.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::interfaces::{ConnectionProvider, Result, StoreConnection, StoreError};
use crate::lock::{AdvisoryLock, LockKey};
use crate::storage::schema::{self, EventStoreColumn, DEFAULT_EVENT_STORE_TABLE};

/// Options for opening a session.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Event-store table name. Blank or `None` selects `event_store`.
    pub table_name: Option<String>,
    /// Give up waiting for the advisory lock after this long.
    pub lock_timeout: Option<Duration>,
}

impl StoreOptions {
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    fn resolved_table_name(&self) -> String {
        match self.table_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => DEFAULT_EVENT_STORE_TABLE.to_string(),
        }
    }
}

/// A ready outbox store: one owned connection whose event-store table is
/// known to exist.
pub struct OutboxStore<C: StoreConnection> {
    conn: C,
    lock: AdvisoryLock,
    database_name: String,
    schema_name: String,
    table_name: String,
}

impl<C: StoreConnection> OutboxStore<C> {
    /// Obtain a connection from `provider` and open a session on it.
    pub async fn open<P>(provider: &P, options: StoreOptions) -> Result<Self>
    where
        P: ConnectionProvider<Connection = C>,
    {
        let conn = provider.connect().await.map_err(StoreError::Connection)?;
        Self::with_connection(conn, options).await
    }

    /// Open a session on an existing connection.
    ///
    /// On failure the connection is dropped, which also frees any advisory
    /// lock the server still associates with it.
    pub async fn with_connection(mut conn: C, options: StoreOptions) -> Result<Self> {
        let database_name = non_empty(conn.current_database().await)?
            .ok_or(StoreError::NoDatabaseName)?;
        let schema_name =
            non_empty(conn.current_schema().await)?.ok_or(StoreError::NoSchema)?;
        let table_name = options.resolved_table_name();

        debug!(
            database = %database_name,
            schema = %schema_name,
            table = %table_name,
            "Resolved store context"
        );

        let mut store = Self {
            conn,
            lock: AdvisoryLock::new(&database_name, &schema_name),
            database_name,
            schema_name,
            table_name,
        };
        store.ensure_table(options.lock_timeout).await?;
        Ok(store)
    }

    /// Lock, provision the table, and release the lock on every path.
    async fn ensure_table(&mut self, lock_timeout: Option<Duration>) -> Result<()> {
        self.lock
            .acquire_timeout(&mut self.conn, lock_timeout)
            .await?;

        let ensured =
            schema::ensure_table(&mut self.conn, &self.schema_name, &self.table_name).await;
        let released = self.lock.release(&mut self.conn).await;

        match (ensured, released) {
            (Ok(_), Ok(())) => Ok(()),
            (Err(err), Ok(())) => Err(err),
            (Ok(_), Err(release)) => {
                warn!(
                    key = %self.lock.key(),
                    schema = %self.schema_name,
                    table = %self.table_name,
                    error = %release,
                    "Event store table is ready but the advisory lock may still be held"
                );
                Err(release)
            }
            (Err(err), Err(release)) => {
                warn!(
                    key = %self.lock.key(),
                    error = %release,
                    "Failed to release advisory lock after table setup failed"
                );
                Err(StoreError::UnlockAfterFailure {
                    source: Box::new(err),
                    release: Box::new(release),
                })
            }
        }
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Key of the advisory lock shared by every session on this schema.
    pub fn lock_key(&self) -> LockKey {
        self.lock.key()
    }

    /// Whether this session currently holds its advisory lock.
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Event-store column layout, in table order.
    pub fn columns(&self) -> &'static [EventStoreColumn] {
        &EventStoreColumn::ALL
    }

    /// The owned connection, for code reading and writing outbox rows.
    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    /// Close the connection.
    pub async fn close(self) -> Result<()> {
        self.conn.close().await.map_err(StoreError::Close)?;
        info!(
            database = %self.database_name,
            schema = %self.schema_name,
            "Outbox store closed"
        );
        Ok(())
    }
}

/// Treat NULL and blank names alike.
fn non_empty(
    resolved: std::result::Result<Option<String>, sqlx::Error>,
) -> Result<Option<String>> {
    let name = resolved.map_err(StoreError::Connection)?;
    Ok(name.filter(|n| !n.is_empty()))
}

#[cfg(test)]
mod tests;
