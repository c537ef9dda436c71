use std::time::Duration;

use super::*;
use crate::lock::LockKey;
use crate::storage::mock::{MockCall, MockConnection, MockDatabase, MockOperation};

fn expected_calls(table: &str) -> Vec<MockCall> {
    let key = LockKey::derive("test", "test_schema");
    vec![
        MockCall::CurrentDatabase,
        MockCall::CurrentSchema,
        MockCall::AdvisoryLock(key),
        MockCall::TableExists {
            schema: "test_schema".to_string(),
            table: table.to_string(),
        },
    ]
}

#[tokio::test]
async fn test_open_provisions_table() {
    let db = MockDatabase::new("test", "test_schema");

    let store = OutboxStore::open(&db, StoreOptions::default()).await.unwrap();

    assert_eq!(store.database_name(), "test");
    assert_eq!(store.schema_name(), "test_schema");
    assert_eq!(store.table_name(), "event_store");
    assert_eq!(store.lock_key(), LockKey::derive("test", "test_schema"));
    assert!(!store.is_locked());
    assert_eq!(store.columns().len(), 6);

    let calls = db.calls().await;
    assert_eq!(calls[..4], expected_calls("event_store")[..]);
    assert!(
        matches!(&calls[4], MockCall::Execute(sql) if sql.starts_with(r#"CREATE TABLE IF NOT EXISTS "test_schema"."event_store""#))
    );
    assert_eq!(
        calls.last(),
        Some(&MockCall::AdvisoryUnlock(LockKey::derive("test", "test_schema")))
    );
    assert!(db.has_table("test_schema", "event_store").await);
}

#[tokio::test]
async fn test_open_with_existing_table_skips_create() {
    let db = MockDatabase::new("test", "test_schema");
    db.add_table("test_schema", "event_store").await;

    OutboxStore::open(&db, StoreOptions::default()).await.unwrap();

    let mut expected = expected_calls("event_store");
    expected.push(MockCall::AdvisoryUnlock(LockKey::derive(
        "test",
        "test_schema",
    )));
    assert_eq!(db.calls().await, expected);
}

#[tokio::test]
async fn test_reopen_is_idempotent() {
    let db = MockDatabase::new("test", "test_schema");

    OutboxStore::open(&db, StoreOptions::default()).await.unwrap();
    OutboxStore::open(&db, StoreOptions::default()).await.unwrap();

    assert_eq!(db.create_table_calls().await, 1);
    assert_eq!(db.lock_calls().await, 2);
    assert_eq!(db.unlock_calls().await, 2);
}

#[tokio::test]
async fn test_table_name_override() {
    let db = MockDatabase::new("test", "test_schema");

    let store = OutboxStore::open(&db, StoreOptions::default().with_table_name("outbox_events"))
        .await
        .unwrap();

    assert_eq!(store.table_name(), "outbox_events");
    assert!(db.has_table("test_schema", "outbox_events").await);
}

#[tokio::test]
async fn test_blank_table_name_uses_default() {
    let db = MockDatabase::new("test", "test_schema");

    let store = OutboxStore::open(&db, StoreOptions::default().with_table_name("  "))
        .await
        .unwrap();

    assert_eq!(store.table_name(), DEFAULT_EVENT_STORE_TABLE);
}

#[tokio::test]
async fn test_connect_failure() {
    let db = MockDatabase::new("test", "test_schema");
    db.set_fail_on(MockOperation::Connect, true).await;

    let err = OutboxStore::open(&db, StoreOptions::default())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, StoreError::Connection(_)));
    assert!(db.calls().await.is_empty());
}

#[tokio::test]
async fn test_empty_database_name() {
    let db = MockDatabase::new("", "test_schema");

    let err = OutboxStore::open(&db, StoreOptions::default())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, StoreError::NoDatabaseName));
    assert_eq!(db.lock_calls().await, 0);
}

#[tokio::test]
async fn test_null_database_name() {
    let db = MockDatabase::new("test", "test_schema");
    db.set_database_name(None).await;

    let err = OutboxStore::open(&db, StoreOptions::default())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, StoreError::NoDatabaseName));
}

#[tokio::test]
async fn test_empty_schema_name() {
    let db = MockDatabase::new("test", "");

    let err = OutboxStore::open(&db, StoreOptions::default())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, StoreError::NoSchema));
    assert_eq!(db.lock_calls().await, 0);
    assert_eq!(db.create_table_calls().await, 0);
}

#[tokio::test]
async fn test_null_schema_name() {
    let db = MockDatabase::new("test", "test_schema");
    db.set_schema_name(None).await;

    let err = OutboxStore::open(&db, StoreOptions::default())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, StoreError::NoSchema));
}

#[tokio::test]
async fn test_context_query_failure_is_connection_error() {
    let db = MockDatabase::new("test", "test_schema");
    db.set_fail_on(MockOperation::CurrentSchema, true).await;

    let err = OutboxStore::open(&db, StoreOptions::default())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, StoreError::Connection(_)));
}

#[tokio::test]
async fn test_acquire_failure_skips_ensure() {
    let db = MockDatabase::new("test", "test_schema");
    db.set_fail_on(MockOperation::AdvisoryLock, true).await;

    let err = OutboxStore::open(&db, StoreOptions::default())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, StoreError::LockAcquire { .. }));
    let calls = db.calls().await;
    assert!(!calls
        .iter()
        .any(|c| matches!(c, MockCall::TableExists { .. } | MockCall::Execute(_))));
    assert_eq!(db.unlock_calls().await, 0);
}

#[tokio::test]
async fn test_create_failure_still_releases_once() {
    let db = MockDatabase::new("test", "test_schema");
    db.set_fail_on(MockOperation::Execute, true).await;

    let err = OutboxStore::open(&db, StoreOptions::default())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, StoreError::SchemaInit { .. }));
    assert!(!err.is_leaked_lock());
    assert_eq!(db.unlock_calls().await, 1);
}

#[tokio::test]
async fn test_existence_check_failure_still_releases_once() {
    let db = MockDatabase::new("test", "test_schema");
    db.set_fail_on(MockOperation::TableExists, true).await;

    let err = OutboxStore::open(&db, StoreOptions::default())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, StoreError::SchemaInit { .. }));
    assert_eq!(db.unlock_calls().await, 1);
}

#[tokio::test]
async fn test_reopen_after_index_failure_creates_indexes() {
    let db = MockDatabase::new("test", "test_schema");
    db.set_fail_on(MockOperation::CreateIndex, true).await;

    let err = OutboxStore::open(&db, StoreOptions::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::SchemaInit { .. }));
    assert!(!db.has_table("test_schema", "event_store").await);

    db.set_fail_on(MockOperation::CreateIndex, false).await;
    OutboxStore::open(&db, StoreOptions::default()).await.unwrap();

    assert!(db.has_table("test_schema", "event_store").await);
    assert!(db.has_index("test_schema", "event_store_dispatched_at_idx").await);
    assert!(db.has_index("test_schema", "event_store_dispatched_idx").await);
    assert_eq!(db.unlock_calls().await, 2);
}

#[tokio::test]
async fn test_release_failure_after_successful_create() {
    let db = MockDatabase::new("test", "test_schema");
    db.set_fail_on(MockOperation::AdvisoryUnlock, true).await;

    let err = OutboxStore::open(&db, StoreOptions::default())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, StoreError::LockRelease { .. }));
    assert!(err.is_leaked_lock());
    assert!(db.has_table("test_schema", "event_store").await);
}

#[tokio::test]
async fn test_create_and_release_failure_keeps_create_error_primary() {
    let db = MockDatabase::new("test", "test_schema");
    db.set_fail_on(MockOperation::Execute, true).await;
    db.set_fail_on(MockOperation::AdvisoryUnlock, true).await;

    let err = OutboxStore::open(&db, StoreOptions::default())
        .await
        .err()
        .unwrap();

    match err {
        StoreError::UnlockAfterFailure { source, release } => {
            assert!(matches!(*source, StoreError::SchemaInit { .. }));
            assert!(matches!(*release, StoreError::LockRelease { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(db.unlock_calls().await, 1);
}

#[tokio::test]
async fn test_failed_open_frees_server_lock() {
    let db = MockDatabase::new("test", "test_schema");
    db.set_fail_on(MockOperation::AdvisoryUnlock, true).await;
    assert!(OutboxStore::open(&db, StoreOptions::default()).await.is_err());

    // The failed session's connection is gone, so the lock is free again.
    db.set_fail_on(MockOperation::AdvisoryUnlock, false).await;
    let opened = tokio::time::timeout(
        Duration::from_secs(5),
        OutboxStore::open(&db, StoreOptions::default()),
    )
    .await;
    assert!(opened.unwrap().is_ok());
}

#[tokio::test]
async fn test_lock_timeout_when_schema_is_busy() {
    let db = MockDatabase::new("test", "test_schema");
    let mut holder = db.connection();
    assert!(holder
        .advisory_lock(LockKey::derive("test", "test_schema"), None)
        .await
        .unwrap());

    let err = OutboxStore::open(
        &db,
        StoreOptions::default().with_lock_timeout(Duration::from_millis(50)),
    )
    .await
    .err()
    .unwrap();

    assert!(matches!(err, StoreError::LockTimeout { .. }));
    assert_eq!(db.create_table_calls().await, 0);
    assert_eq!(db.unlock_calls().await, 0);
}

#[tokio::test]
async fn test_concurrent_opens_create_exactly_once() {
    let db = MockDatabase::new("test", "test_schema");
    db.set_table_exists_delay(Some(Duration::from_millis(10)))
        .await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            OutboxStore::open(&db, StoreOptions::default())
                .await
                .map(|store| store.table_name().to_string())
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "event_store");
    }

    assert_eq!(db.create_table_calls().await, 1);
    assert_eq!(db.lock_calls().await, 8);
    assert_eq!(db.unlock_calls().await, 8);
}

#[tokio::test]
async fn test_with_connection() {
    let db = MockDatabase::new("test", "test_schema");

    let store: OutboxStore<MockConnection> =
        OutboxStore::with_connection(db.connection(), StoreOptions::default())
            .await
            .unwrap();

    assert_eq!(store.database_name(), "test");
}

#[tokio::test]
async fn test_close() {
    let db = MockDatabase::new("test", "test_schema");
    let store = OutboxStore::open(&db, StoreOptions::default()).await.unwrap();

    store.close().await.unwrap();

    assert_eq!(db.calls().await.last(), Some(&MockCall::Close));
}

#[tokio::test]
async fn test_close_failure() {
    let db = MockDatabase::new("test", "test_schema");
    let store = OutboxStore::open(&db, StoreOptions::default()).await.unwrap();
    db.set_fail_on(MockOperation::Close, true).await;

    let err = store.close().await.unwrap_err();

    assert!(matches!(err, StoreError::Close(_)));
    assert!(err.to_string().starts_with("Failed to close connection"));
}

#[tokio::test]
async fn test_connection_mut_reaches_session() {
    let db = MockDatabase::new("test", "test_schema");
    let mut store = OutboxStore::open(&db, StoreOptions::default()).await.unwrap();

    store
        .connection_mut()
        .execute("INSERT INTO event_store (payload) VALUES ('\\x00')")
        .await
        .unwrap();

    assert!(matches!(db.calls().await.last(), Some(MockCall::Execute(sql)) if sql.starts_with("INSERT")));
}
