//! Outbox event-store provisioning.
//!
//! Many processes may start against the same PostgreSQL database at once.
//! Each opens an [`OutboxStore`], which creates the event-store table exactly
//! once, serialized by a session-level advisory lock keyed on the database
//! and schema names.
//!
//! ```no_run
//! # async fn run(pool: sqlx::PgPool) -> outbox_store::Result<()> {
//! use outbox_store::{OutboxStore, StoreOptions};
//!
//! let store = OutboxStore::open(&pool, StoreOptions::default()).await?;
//! assert_eq!(store.table_name(), "event_store");
//! store.close().await
//! # }
//! ```

pub mod config;
pub mod interfaces;
pub mod lock;
pub mod storage;
pub mod store;
pub mod utils;

pub use interfaces::{ConnectionProvider, Result, StoreConnection, StoreError};
pub use lock::{AdvisoryLock, LockKey, LockState};
pub use storage::{EventStoreColumn, DEFAULT_EVENT_STORE_TABLE};
pub use store::{OutboxStore, StoreOptions};
