//! Storage configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::storage::DEFAULT_EVENT_STORE_TABLE;
use crate::store::StoreOptions;

/// Environment variable for database URL.
pub const DATABASE_URL_ENV_VAR: &str = "DATABASE_URL";

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// PostgreSQL connection URI.
    /// Overridden by `DATABASE_URL` when set.
    pub database_url: String,
    /// Event-store table name.
    /// Default: event_store
    pub table_name: String,
    /// Seconds to wait for the schema's advisory lock.
    /// Unset waits indefinitely.
    pub lock_timeout_secs: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost:5432/outbox".to_string(),
            table_name: DEFAULT_EVENT_STORE_TABLE.to_string(),
            lock_timeout_secs: None,
        }
    }
}

impl StorageConfig {
    /// Session options derived from this configuration.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            table_name: Some(self.table_name.clone()),
            lock_timeout: self.lock_timeout_secs.map(Duration::from_secs),
        }
    }

    pub(super) fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(DATABASE_URL_ENV_VAR) {
            self.database_url = url;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_default() {
        let storage = StorageConfig::default();
        assert_eq!(storage.database_url, "postgres://localhost:5432/outbox");
        assert_eq!(storage.table_name, "event_store");
        assert!(storage.lock_timeout_secs.is_none());
    }

    #[test]
    fn test_store_options() {
        let storage = StorageConfig {
            table_name: "outbox_events".to_string(),
            lock_timeout_secs: Some(15),
            ..StorageConfig::default()
        };

        let options = storage.store_options();
        assert_eq!(options.table_name.as_deref(), Some("outbox_events"));
        assert_eq!(options.lock_timeout, Some(Duration::from_secs(15)));
    }
}
