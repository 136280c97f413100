//! Storage round trips against a real SQL engine.
//!
//! Uses an in-process SQLite database through the same `Any` driver as
//! MySQL, so the generated statements and column decoding are exercised
//! without Docker:
//! ```bash
//! cargo test --test sqlite_backend
//! ```

use std::sync::Arc;

use tiered_orm::cache::InMemoryRemoteCache;
use tiered_orm::{EntitySchema, FieldDescriptor, OrmEngine, OrmError, Registry, SqlPool, StorageError};

async fn engine() -> (Arc<OrmEngine>, Arc<SqlPool>) {
    // one connection: every `sqlite::memory:` connection is its own database
    let pool = Arc::new(SqlPool::new("default", "sqlite::memory:", 1).await.unwrap());
    pool.execute_raw(
        "CREATE TABLE `Customer` (
            `ID` INTEGER PRIMARY KEY,
            `Name` TEXT NOT NULL DEFAULT '',
            `Age` INTEGER NOT NULL DEFAULT 0,
            `Balance` REAL,
            `Active` INTEGER NOT NULL DEFAULT 0,
            `Code` TEXT UNIQUE
        )",
    )
    .await
    .unwrap();
    pool.execute_raw(
        "CREATE TABLE `Invoice` (
            `ID` INTEGER PRIMARY KEY,
            `Customer` INTEGER,
            `Total` REAL
        )",
    )
    .await
    .unwrap();

    let mut registry = Registry::new();
    registry.register_storage_pool(pool.clone());
    registry.register_remote_cache(Arc::new(InMemoryRemoteCache::new("default")));
    registry.register_entity(
        EntitySchema::new("Customer")
            .field(FieldDescriptor::text("Name"))
            .field(FieldDescriptor::uint("Age").bits(8))
            .field(FieldDescriptor::float("Balance", 2).nullable())
            .field(FieldDescriptor::boolean("Active"))
            .field(FieldDescriptor::text("Code").nullable()),
    );
    registry.register_entity(
        EntitySchema::new("Invoice")
            .field(FieldDescriptor::reference("Customer", "Customer").nullable())
            .field(FieldDescriptor::float("Total", 2))
            .remote_cache("default")
            .cached_reference("Customer"),
    );
    (registry.validate().unwrap(), pool)
}

#[tokio::test]
async fn test_insert_then_read_from_storage() {
    let (engine, _pool) = engine().await;
    let mut ctx = engine.context();
    let customer = ctx.new_record("Customer").await.unwrap();
    customer.set("Name", "Ann").unwrap();
    customer.set("Age", 41u64).unwrap();
    customer.set("Balance", 10.129).unwrap();
    customer.set("Active", true).unwrap();
    let id = customer.id();
    assert_eq!(id, 1);
    ctx.flush().await.unwrap();

    // no caches on Customer: this read goes to SQLite
    let loaded = engine.context().get_by_id("Customer", id).await.unwrap().unwrap();
    assert_eq!(loaded.get("Name").unwrap().as_str(), Some("Ann"));
    assert_eq!(loaded.get("Age").unwrap().as_u64(), Some(41));
    assert_eq!(loaded.get("Balance").unwrap().as_f64(), Some(10.13));
    assert_eq!(loaded.get("Active").unwrap().as_bool(), Some(true));
    assert!(loaded.get("Code").unwrap().is_null());
}

#[tokio::test]
async fn test_update_and_delete_round_trip() {
    let (engine, _pool) = engine().await;
    let mut ctx = engine.context();
    let customer = ctx.new_record("Customer").await.unwrap();
    customer.set("Name", "Bob").unwrap();
    let id = customer.id();
    ctx.flush().await.unwrap();

    let loaded = ctx.get_by_id("Customer", id).await.unwrap().unwrap();
    let edit = ctx.edit(&loaded).unwrap();
    edit.set("Name", "Robert").unwrap();
    edit.set("Age", 30u64).unwrap();
    ctx.flush().await.unwrap();

    let loaded = ctx.get_by_id("Customer", id).await.unwrap().unwrap();
    assert_eq!(loaded.get("Name").unwrap().as_str(), Some("Robert"));
    assert_eq!(loaded.get("Age").unwrap().as_u64(), Some(30));

    ctx.delete(&loaded).unwrap();
    ctx.flush().await.unwrap();
    assert!(ctx.get_by_id("Customer", id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_ids_continue_after_existing_rows() {
    let (engine, pool) = engine().await;
    pool.execute_raw("INSERT INTO `Customer` (`ID`, `Name`) VALUES (41, 'legacy')")
        .await
        .unwrap();

    let mut ctx = engine.context();
    assert_eq!(ctx.new_record("Customer").await.unwrap().id(), 42);
    assert_eq!(ctx.new_record("Customer").await.unwrap().id(), 43);
}

#[tokio::test]
async fn test_storage_constraint_rolls_back_transaction() {
    let (engine, pool) = engine().await;
    let mut ctx = engine.context();
    for name in ["first", "second"] {
        let customer = ctx.new_record("Customer").await.unwrap();
        customer.set("Name", name).unwrap();
        customer.set("Code", "C-1").unwrap();
    }

    let err = ctx.flush_in_transaction().await.unwrap_err();
    assert!(matches!(err, OrmError::Storage(StorageError::Constraint { .. })), "{:?}", err);
    assert_eq!(ctx.tracked(), 2);

    let rows = sqlx::query("SELECT COUNT(*) FROM `Customer`")
        .fetch_one(&pool.pool())
        .await
        .map(|row| sqlx::Row::get::<i64, _>(&row, 0))
        .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn test_reference_collection_loaded_in_id_order() {
    let (engine, _pool) = engine().await;
    let mut ctx = engine.context();
    let customer = ctx.new_record("Customer").await.unwrap();
    customer.set("Name", "Ann").unwrap();
    let customer = customer.id();
    ctx.flush().await.unwrap();

    let mut invoices = Vec::new();
    for total in [12.5, 7.25, 99.0] {
        let invoice = ctx.new_record("Invoice").await.unwrap();
        invoice.set("Customer", customer).unwrap();
        invoice.set("Total", total).unwrap();
        invoices.push(invoice.id());
    }
    ctx.flush().await.unwrap();

    let loaded = ctx.get_by_reference("Invoice", "Customer", customer).await.unwrap();
    let ids: Vec<u64> = loaded.iter().map(|r| r.id()).collect();
    assert_eq!(ids, invoices);
    assert_eq!(loaded[1].get("Total").unwrap().as_f64(), Some(7.25));

    let many = ctx.get_by_ids("Invoice", &[invoices[2], 999, invoices[0]]).await.unwrap();
    assert_eq!(many[0].as_ref().map(|r| r.id()), Some(invoices[2]));
    assert!(many[1].is_none());
    assert_eq!(many[2].as_ref().map(|r| r.id()), Some(invoices[0]));
}
