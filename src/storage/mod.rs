//! Storage backends and the event-store schema.

pub mod postgres;
pub mod schema;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use schema::{EventStoreColumn, DEFAULT_EVENT_STORE_TABLE};
