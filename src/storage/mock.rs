//! In-memory database for testing the session protocol.
//!
//! Connections opened from one [`MockDatabase`] share its tables and its
//! advisory locks, so several sessions can race against each other the way
//! they would against a real server. Every connection call is recorded and
//! any operation can be made to fail.
//!
//! Lock requests behave like PostgreSQL's: once issued they stay queued even
//! if the caller stops waiting, and a late grant is picked up by the next call
//! on the same connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;

use crate::interfaces::{ConnectionProvider, StoreConnection};
use crate::lock::LockKey;

/// Connection operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Connect,
    CurrentDatabase,
    CurrentSchema,
    AdvisoryLock,
    AdvisoryUnlock,
    TableExists,
    Execute,
    /// Fails `CREATE INDEX` statements only.
    CreateIndex,
    Close,
}

/// A recorded connection call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CurrentDatabase,
    CurrentSchema,
    AdvisoryLock(LockKey),
    AdvisoryUnlock(LockKey),
    TableExists { schema: String, table: String },
    Execute(String),
    Close,
}

#[derive(Default)]
struct MockState {
    database_name: RwLock<Option<String>>,
    schema_name: RwLock<Option<String>>,
    tables: RwLock<HashSet<(String, String)>>,
    indexes: RwLock<HashSet<(String, String)>>,
    locks: RwLock<HashMap<LockKey, Arc<Mutex<()>>>>,
    calls: RwLock<Vec<MockCall>>,
    failures: RwLock<HashSet<MockOperation>>,
    table_exists_delay: RwLock<Option<Duration>>,
}

/// Shared in-memory database. Cloning yields another handle to the same one.
#[derive(Clone, Default)]
pub struct MockDatabase {
    state: Arc<MockState>,
}

impl MockDatabase {
    /// Database reporting the given current database and schema names.
    pub fn new(database_name: &str, schema_name: &str) -> Self {
        let state = MockState {
            database_name: RwLock::new(Some(database_name.to_string())),
            schema_name: RwLock::new(Some(schema_name.to_string())),
            ..MockState::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    pub async fn set_database_name(&self, name: Option<&str>) {
        *self.state.database_name.write().await = name.map(str::to_string);
    }

    pub async fn set_schema_name(&self, name: Option<&str>) {
        *self.state.schema_name.write().await = name.map(str::to_string);
    }

    pub async fn set_fail_on(&self, operation: MockOperation, fail: bool) {
        let mut failures = self.state.failures.write().await;
        if fail {
            failures.insert(operation);
        } else {
            failures.remove(&operation);
        }
    }

    /// Delay every existence check, widening the window between check and
    /// create for race tests.
    pub async fn set_table_exists_delay(&self, delay: Option<Duration>) {
        *self.state.table_exists_delay.write().await = delay;
    }

    /// Pretend `schema.table` was provisioned earlier.
    pub async fn add_table(&self, schema: &str, table: &str) {
        self.state
            .tables
            .write()
            .await
            .insert((schema.to_string(), table.to_string()));
    }

    pub async fn has_table(&self, schema: &str, table: &str) -> bool {
        self.state
            .tables
            .read()
            .await
            .contains(&(schema.to_string(), table.to_string()))
    }

    /// Whether index `name` exists in `schema`.
    pub async fn has_index(&self, schema: &str, name: &str) -> bool {
        self.state
            .indexes
            .read()
            .await
            .contains(&(schema.to_string(), name.to_string()))
    }

    /// Open a connection without going through [`ConnectionProvider`].
    pub fn connection(&self) -> MockConnection {
        MockConnection {
            db: self.clone(),
            held: HashMap::new(),
            queued: None,
        }
    }

    pub async fn calls(&self) -> Vec<MockCall> {
        self.state.calls.read().await.clone()
    }

    pub async fn lock_calls(&self) -> usize {
        self.count(|call| matches!(call, MockCall::AdvisoryLock(_))).await
    }

    pub async fn unlock_calls(&self) -> usize {
        self.count(|call| matches!(call, MockCall::AdvisoryUnlock(_))).await
    }

    pub async fn create_table_calls(&self) -> usize {
        self.count(|call| matches!(call, MockCall::Execute(sql) if sql.starts_with("CREATE TABLE")))
            .await
    }

    async fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.state
            .calls
            .read()
            .await
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    async fn record(&self, call: MockCall) {
        self.state.calls.write().await.push(call);
    }

    async fn check(&self, operation: MockOperation) -> Result<(), sqlx::Error> {
        if self.state.failures.read().await.contains(&operation) {
            return Err(sqlx::Error::Protocol(format!(
                "mock failure injected for {operation:?}"
            )));
        }
        Ok(())
    }

    /// Run one statement against a staged copy of the catalog.
    async fn apply(
        &self,
        sql: &str,
        tables: &mut HashSet<(String, String)>,
        indexes: &mut HashSet<(String, String)>,
    ) -> Result<(), sqlx::Error> {
        self.record(MockCall::Execute(sql.to_string())).await;
        self.check(MockOperation::Execute).await?;

        let idents = quoted_idents(sql);
        if sql.starts_with("CREATE TABLE") {
            if let [schema, table, ..] = idents.as_slice() {
                if !tables.insert((schema.clone(), table.clone()))
                    && !sql.contains("IF NOT EXISTS")
                {
                    return Err(sqlx::Error::Protocol("relation already exists".to_string()));
                }
            }
        } else if sql.starts_with("CREATE INDEX") {
            self.check(MockOperation::CreateIndex).await?;
            if let [name, schema, table, ..] = idents.as_slice() {
                if !tables.contains(&(schema.clone(), table.clone())) {
                    return Err(sqlx::Error::Protocol("relation does not exist".to_string()));
                }
                indexes.insert((schema.clone(), name.clone()));
            }
        }
        Ok(())
    }

    async fn lock_for(&self, key: LockKey) -> Arc<Mutex<()>> {
        self.state
            .locks
            .write()
            .await
            .entry(key)
            .or_default()
            .clone()
    }
}

#[async_trait]
impl ConnectionProvider for MockDatabase {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection, sqlx::Error> {
        self.check(MockOperation::Connect).await?;
        Ok(self.connection())
    }
}

/// One session against a [`MockDatabase`].
///
/// Advisory locks stack per key like PostgreSQL's and are all freed when the
/// connection is dropped.
pub struct MockConnection {
    db: MockDatabase,
    held: HashMap<LockKey, (OwnedMutexGuard<()>, usize)>,
    /// Lock request still waiting server side.
    queued: Option<(LockKey, JoinHandle<Option<OwnedMutexGuard<()>>>)>,
}

impl MockConnection {
    pub fn holds(&self, key: LockKey) -> bool {
        self.held.contains_key(&key)
    }

    fn grant(&mut self, key: LockKey, guard: OwnedMutexGuard<()>) {
        match self.held.get_mut(&key) {
            Some((_, depth)) => *depth += 1,
            None => {
                self.held.insert(key, (guard, 1));
            }
        }
    }

    /// Wait out a lock request left behind by a dropped call, the way a
    /// driver drains a pending reply before sending the next statement.
    async fn settle(&mut self) -> Result<(), sqlx::Error> {
        let Some((key, handle)) = self.queued.as_mut() else {
            return Ok(());
        };
        let key = *key;
        let outcome = handle.await;
        self.queued = None;

        let granted = outcome.map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
        if let Some(guard) = granted {
            self.grant(key, guard);
        }
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.queued.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl StoreConnection for MockConnection {
    async fn current_database(&mut self) -> Result<Option<String>, sqlx::Error> {
        self.settle().await?;
        self.db.record(MockCall::CurrentDatabase).await;
        self.db.check(MockOperation::CurrentDatabase).await?;
        Ok(self.db.state.database_name.read().await.clone())
    }

    async fn current_schema(&mut self) -> Result<Option<String>, sqlx::Error> {
        self.settle().await?;
        self.db.record(MockCall::CurrentSchema).await;
        self.db.check(MockOperation::CurrentSchema).await?;
        Ok(self.db.state.schema_name.read().await.clone())
    }

    async fn advisory_lock(
        &mut self,
        key: LockKey,
        timeout: Option<Duration>,
    ) -> Result<bool, sqlx::Error> {
        self.settle().await?;
        self.db.record(MockCall::AdvisoryLock(key)).await;
        self.db.check(MockOperation::AdvisoryLock).await?;

        if let Some((_, depth)) = self.held.get_mut(&key) {
            *depth += 1;
            return Ok(true);
        }

        let mutex = self.db.lock_for(key).await;
        if timeout.is_some_and(|t| t.is_zero()) {
            return Ok(match mutex.try_lock_owned() {
                Ok(guard) => {
                    self.grant(key, guard);
                    true
                }
                Err(_) => false,
            });
        }

        // The request lives outside this future, like a statement already
        // sent to the server.
        let handle = tokio::spawn(async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, mutex.lock_owned()).await.ok(),
                None => Some(mutex.lock_owned().await),
            }
        });
        self.queued = Some((key, handle));
        self.settle().await?;
        Ok(self.holds(key))
    }

    async fn advisory_unlock(&mut self, key: LockKey) -> Result<bool, sqlx::Error> {
        self.settle().await?;
        self.db.record(MockCall::AdvisoryUnlock(key)).await;
        self.db.check(MockOperation::AdvisoryUnlock).await?;

        let Some((_, depth)) = self.held.get_mut(&key) else {
            return Ok(false);
        };
        *depth -= 1;
        if *depth == 0 {
            self.held.remove(&key);
        }
        Ok(true)
    }

    async fn table_exists(&mut self, schema: &str, table: &str) -> Result<bool, sqlx::Error> {
        self.settle().await?;
        self.db
            .record(MockCall::TableExists {
                schema: schema.to_string(),
                table: table.to_string(),
            })
            .await;
        self.db.check(MockOperation::TableExists).await?;

        let delay = *self.db.state.table_exists_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(self.db.has_table(schema, table).await)
    }

    async fn execute(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        self.execute_transaction(&[sql.to_string()]).await
    }

    async fn execute_transaction(&mut self, statements: &[String]) -> Result<(), sqlx::Error> {
        self.settle().await?;
        let mut tables = self.db.state.tables.write().await;
        let mut indexes = self.db.state.indexes.write().await;

        // Staged copies are discarded on failure, like a rolled back transaction.
        let mut staged_tables = tables.clone();
        let mut staged_indexes = indexes.clone();
        for statement in statements {
            self.db
                .apply(statement, &mut staged_tables, &mut staged_indexes)
                .await?;
        }

        *tables = staged_tables;
        *indexes = staged_indexes;
        Ok(())
    }

    async fn close(self) -> Result<(), sqlx::Error> {
        self.db.record(MockCall::Close).await;
        self.db.check(MockOperation::Close).await
    }
}

/// Quoted identifiers of a statement, in order.
fn quoted_idents(sql: &str) -> Vec<String> {
    sql.split('"').skip(1).step_by(2).map(str::to_string).collect()
}
