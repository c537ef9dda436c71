//! Event-store table definition and its idempotent provisioning.

use sea_query::{Alias, ColumnDef, Iden, Index, PostgresQueryBuilder, Table};
use tracing::{debug, info};

use crate::interfaces::{Result, StoreConnection, StoreError};

/// Table name used when none is configured.
pub const DEFAULT_EVENT_STORE_TABLE: &str = "event_store";

/// Event-store table columns.
#[derive(Iden, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStoreColumn {
    #[iden = "id"]
    Id,
    #[iden = "dispatched"]
    Dispatched,
    #[iden = "dispatched_at"]
    DispatchedAt,
    #[iden = "payload"]
    Payload,
    #[iden = "options"]
    Options,
    #[iden = "headers"]
    Headers,
}

impl EventStoreColumn {
    /// Columns in table order.
    pub const ALL: [EventStoreColumn; 6] = [
        EventStoreColumn::Id,
        EventStoreColumn::Dispatched,
        EventStoreColumn::DispatchedAt,
        EventStoreColumn::Payload,
        EventStoreColumn::Options,
        EventStoreColumn::Headers,
    ];

    pub fn name(self) -> String {
        self.to_string()
    }
}

/// `CREATE TABLE IF NOT EXISTS` for the event store in `schema`.
pub fn create_table_statement(schema: &str, table: &str) -> String {
    Table::create()
        .table((Alias::new(schema), Alias::new(table)))
        .if_not_exists()
        .col(
            ColumnDef::new(EventStoreColumn::Id)
                .integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(
            ColumnDef::new(EventStoreColumn::Dispatched)
                .boolean()
                .not_null()
                .default(false),
        )
        .col(ColumnDef::new(EventStoreColumn::DispatchedAt).timestamp().null())
        .col(ColumnDef::new(EventStoreColumn::Payload).binary().not_null())
        .col(ColumnDef::new(EventStoreColumn::Options).text().null())
        .col(ColumnDef::new(EventStoreColumn::Headers).text().null())
        .to_string(PostgresQueryBuilder)
}

/// Indexes the dispatcher polls on.
pub fn create_index_statements(schema: &str, table: &str) -> Vec<String> {
    [
        (EventStoreColumn::DispatchedAt, "dispatched_at"),
        (EventStoreColumn::Dispatched, "dispatched"),
    ]
    .into_iter()
    .map(|(column, suffix)| {
        Index::create()
            .if_not_exists()
            .name(format!("{table}_{suffix}_idx"))
            .table((Alias::new(schema), Alias::new(table)))
            .col(column)
            .to_string(PostgresQueryBuilder)
    })
    .collect()
}

/// Create the event-store table unless it already exists.
///
/// Must run while the caller holds the schema's advisory lock: the lock is
/// what serializes concurrent provisioning, the existence check only makes
/// re-runs cheap. The table and its indexes are created in one transaction,
/// so a failure leaves neither behind and the next run starts over. Returns
/// `true` when the table was created.
pub async fn ensure_table<C: StoreConnection>(
    conn: &mut C,
    schema: &str,
    table: &str,
) -> Result<bool> {
    let schema_err = |source| StoreError::SchemaInit {
        schema: schema.to_string(),
        table: table.to_string(),
        source,
    };

    if conn.table_exists(schema, table).await.map_err(schema_err)? {
        info!(schema, table, "Event store table already exists");
        return Ok(false);
    }

    debug!(schema, table, "Creating event store table");
    let mut statements = vec![create_table_statement(schema, table)];
    statements.extend(create_index_statements(schema, table));
    conn.execute_transaction(&statements)
        .await
        .map_err(schema_err)?;

    info!(schema, table, "Event store table created");
    Ok(true)
}
