//! outbox-init: provision the outbox event-store table
//!
//! Connects to the configured database, creates the event-store table in the
//! connection's current schema unless it exists, and exits. Safe to run from
//! every replica at startup; the advisory lock lets only one of them create
//! the table.
//!
//! ## Configuration
//! - storage.database_url: PostgreSQL URI (or DATABASE_URL)
//! - storage.table_name: event-store table (default: event_store)
//! - storage.lock_timeout_secs: bound on the advisory-lock wait

use std::str::FromStr;

use sqlx::postgres::PgConnectOptions;
use tracing::{error, info};

use outbox_store::config::Config;
use outbox_store::utils::bootstrap::{init_tracing, parse_config_path};
use outbox_store::OutboxStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let connect_options = PgConnectOptions::from_str(&config.storage.database_url)?;

    let store = OutboxStore::open(&connect_options, config.storage.store_options())
        .await
        .map_err(|e| {
            if e.is_leaked_lock() {
                error!(error = %e, "Advisory lock may have been left held; check the database");
            } else {
                error!(error = %e, "Failed to provision event store");
            }
            e
        })?;

    info!(
        database = %store.database_name(),
        schema = %store.schema_name(),
        table = %store.table_name(),
        "Event store ready"
    );

    store.close().await?;
    Ok(())
}
