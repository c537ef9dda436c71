//! PostgreSQL implementation of the connection seam.
//!
//! Advisory locks are session level (`pg_advisory_lock`), so they outlive
//! transactions and are only freed by an explicit unlock or by closing the
//! connection. Lock timeouts are enforced by the server through
//! `lock_timeout`, so an expired wait comes back as an error on the
//! connection instead of leaving a lock request queued behind it.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool};
use sqlx::Connection;

use crate::interfaces::{ConnectionProvider, StoreConnection};
use crate::lock::LockKey;

/// SQLSTATE `lock_not_available`, raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

fn is_lock_timeout(err: &sqlx::Error) -> bool {
    matches!(
        err.as_database_error().and_then(|e| e.code()),
        Some(code) if code == LOCK_NOT_AVAILABLE
    )
}

/// `lock_timeout` setting for `timeout`. Zero disables the setting in
/// PostgreSQL, so the value is at least one millisecond.
fn lock_timeout_setting(timeout: Duration) -> String {
    format!("{}ms", timeout.as_millis().max(1))
}

#[async_trait]
impl StoreConnection for PgConnection {
    async fn current_database(&mut self) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT current_database()")
            .fetch_one(&mut *self)
            .await
    }

    async fn current_schema(&mut self) -> Result<Option<String>, sqlx::Error> {
        // NULL when nothing on the search_path exists.
        sqlx::query_scalar("SELECT current_schema()")
            .fetch_one(&mut *self)
            .await
    }

    async fn advisory_lock(
        &mut self,
        key: LockKey,
        timeout: Option<Duration>,
    ) -> Result<bool, sqlx::Error> {
        let timeout = match timeout {
            None => {
                sqlx::query("SELECT pg_advisory_lock($1)")
                    .bind(key.as_i64())
                    .execute(&mut *self)
                    .await?;
                return Ok(true);
            }
            Some(timeout) if timeout.is_zero() => {
                return sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                    .bind(key.as_i64())
                    .fetch_one(&mut *self)
                    .await;
            }
            Some(timeout) => timeout,
        };

        // The setting is transaction local; the session lock survives COMMIT.
        let mut tx = self.begin().await?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(lock_timeout_setting(timeout))
            .execute(&mut *tx)
            .await?;

        match sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key.as_i64())
            .execute(&mut *tx)
            .await
        {
            Ok(_) => {
                tx.commit().await?;
                Ok(true)
            }
            Err(e) if is_lock_timeout(&e) => {
                tx.rollback().await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn advisory_unlock(&mut self, key: LockKey) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(key.as_i64())
            .fetch_one(&mut *self)
            .await
    }

    async fn table_exists(&mut self, schema: &str, table: &str) -> Result<bool, sqlx::Error> {
        // The catalog, unlike information_schema, lists relations regardless
        // of the current role's privileges on them.
        sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_catalog.pg_class c
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = $1 AND c.relname = $2
            )
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_one(&mut *self)
        .await
    }

    async fn execute(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        sqlx::query(sql).execute(&mut *self).await?;
        Ok(())
    }

    async fn execute_transaction(&mut self, statements: &[String]) -> Result<(), sqlx::Error> {
        let mut tx = self.begin().await?;
        for statement in statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await
    }

    async fn close(self) -> Result<(), sqlx::Error> {
        Connection::close(self).await
    }
}

/// Hands out a connection detached from the pool.
///
/// The session keeps it for its whole life and closes it for real, so a
/// connection that might still hold an advisory lock never goes back into
/// the pool.
#[async_trait]
impl ConnectionProvider for PgPool {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection, sqlx::Error> {
        Ok(self.acquire().await?.detach())
    }
}

/// Opens a dedicated connection.
#[async_trait]
impl ConnectionProvider for PgConnectOptions {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection, sqlx::Error> {
        PgConnection::connect_with(self).await
    }
}
