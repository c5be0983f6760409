use chrono::{TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_test::{assert_err, assert_ok};

use crate::config::InMemoryConfig;
use crate::error::{CounterStoreError, StorageError};
use crate::storage::{CounterCollection, ExpiryWrite, MemoryCollection};

use super::common;

// Helper function to create a MemoryCollection instance for testing
fn create_test_memory() -> MemoryCollection {
    MemoryCollection::new(InMemoryConfig {
        max_entries: 1000,
        sweep_interval: Duration::from_millis(50),
    })
}

#[tokio::test]
async fn test_memory_upsert_counts() {
    let memory = create_test_memory();
    assert_ok!(common::test_upsert_counts(&memory, "memory_counts").await);
}

#[tokio::test]
async fn test_memory_expiry_write_policy() {
    let memory = create_test_memory();
    assert_ok!(common::test_expiry_write_policy(&memory, "memory_policy").await);
}

#[tokio::test]
async fn test_memory_delete() {
    let memory = create_test_memory();
    assert_ok!(common::test_delete(&memory, "memory_delete").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_concurrent_upserts() {
    let memory = Arc::new(create_test_memory());
    assert_ok!(common::test_concurrent_upserts(memory, "memory_concurrent", 16, 50).await);
}

#[tokio::test]
async fn test_capacity_limit_rejects_new_keys_only() {
    let memory = MemoryCollection::new(InMemoryConfig {
        max_entries: 2,
        sweep_interval: Duration::from_secs(60),
    });
    let expiration = Utc::now() + TimeDelta::seconds(60);

    assert_ok!(memory.upsert("a", 1, expiration, ExpiryWrite::OnInsert).await);
    assert_ok!(memory.upsert("b", 1, expiration, ExpiryWrite::OnInsert).await);

    let overflow = memory.upsert("c", 1, expiration, ExpiryWrite::OnInsert).await;
    match overflow {
        Err(CounterStoreError::Storage(StorageError::CapacityExceeded(msg))) => {
            assert!(msg.contains("maximum"), "unexpected message: {}", msg);
        }
        other => panic!("Expected CapacityExceeded, got {:?}", other),
    }

    // existing keys still update when full
    let record = memory
        .upsert("a", 1, expiration, ExpiryWrite::OnInsert)
        .await
        .unwrap();
    assert_eq!(record.counter, 2);
    assert_eq!(memory.len(), 2);
}

#[tokio::test]
async fn test_records_persist_without_provisioning() {
    let memory = create_test_memory();
    let past = Utc::now() - TimeDelta::seconds(1);

    memory
        .upsert("stale", 1, past, ExpiryWrite::OnInsert)
        .await
        .unwrap();
    time::sleep(Duration::from_millis(150)).await;

    assert!(!memory.is_sweeping());
    // without a sweep an expired record is still physically there
    assert!(memory.find("stale").await.unwrap().is_some());
}

#[tokio::test]
async fn test_sweep_removes_expired_records() {
    let memory = create_test_memory();
    let past = Utc::now() - TimeDelta::seconds(1);
    let future = Utc::now() + TimeDelta::seconds(60);

    memory
        .upsert("expired", 1, past, ExpiryWrite::OnInsert)
        .await
        .unwrap();
    memory
        .upsert("alive", 1, future, ExpiryWrite::OnInsert)
        .await
        .unwrap();

    assert_ok!(memory.provision_expiry().await);
    assert!(memory.is_sweeping());

    time::sleep(Duration::from_millis(200)).await;

    assert!(memory.find("expired").await.unwrap().is_none());
    assert!(memory.find("alive").await.unwrap().is_some());
}

#[tokio::test]
async fn test_provisioning_is_idempotent() {
    let memory = create_test_memory();

    for _ in 0..3 {
        assert_ok!(memory.provision_expiry().await);
    }
    assert!(memory.is_sweeping());
}

#[test]
fn test_sweep_now_without_runtime() {
    let memory = create_test_memory();
    let past = Utc::now() - TimeDelta::seconds(5);

    tokio_test::block_on(async {
        memory
            .upsert("old", 1, past, ExpiryWrite::OnInsert)
            .await
            .unwrap();
    });

    assert_eq!(memory.sweep_now(), 1);
    assert!(memory.is_empty());
}

#[tokio::test]
async fn test_delete_all_empties_collection() {
    let memory = create_test_memory();
    let expiration = Utc::now() + TimeDelta::seconds(60);

    for i in 0..5 {
        memory
            .upsert(&format!("key_{}", i), 1, expiration, ExpiryWrite::OnInsert)
            .await
            .unwrap();
    }

    assert_eq!(memory.delete_all().await.unwrap(), 5);
    assert!(memory.is_empty());
    assert_eq!(memory.delete_all().await.unwrap(), 0);
}

#[tokio::test]
async fn test_connect_validates_config() {
    let result = MemoryCollection::connect(InMemoryConfig {
        max_entries: 0,
        sweep_interval: Duration::from_secs(1),
    })
    .await;
    assert_err!(result);
}
