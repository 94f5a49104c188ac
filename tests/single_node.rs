//! Single-node store behaviour.

mod common;

use std::time::Duration;

use common::{test_config, wait_for_leader, wait_until};
use raftkv::{Store, StoreError};
use tempfile::TempDir;

#[tokio::test]
async fn set_get_delete() {
    let dir = TempDir::new().unwrap();
    let store = Store::create(test_config(dir.path())).await.unwrap();
    assert!(wait_for_leader(&store, 5000).await);

    store.set(b"greeting", b"hello").await.unwrap();
    assert_eq!(store.get(b"greeting").unwrap(), b"hello");

    store.set(b"greeting", b"bye").await.unwrap();
    assert_eq!(store.get(b"greeting").unwrap(), b"bye");

    store.delete(b"greeting").await.unwrap();
    assert!(matches!(store.get(b"greeting"), Err(StoreError::KeyNotFound)));

    // deleting a missing key is not an error
    store.delete(b"never-set").await.unwrap();

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_key_and_invalid_commands() {
    let dir = TempDir::new().unwrap();
    let store = Store::create(test_config(dir.path())).await.unwrap();
    assert!(wait_for_leader(&store, 5000).await);

    assert!(matches!(store.get(b"nope"), Err(StoreError::KeyNotFound)));
    assert!(matches!(
        store.set(b"", b"v").await,
        Err(StoreError::Serialization(_))
    ));

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn identity_and_data_survive_restart() {
    let dir = TempDir::new().unwrap();

    let store = Store::create(test_config(dir.path())).await.unwrap();
    assert!(wait_for_leader(&store, 5000).await);
    let node_id = store.node_id();
    assert_ne!(node_id, 0);
    store.set(b"k", b"v").await.unwrap();
    store.shutdown().await.unwrap();
    drop(store);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let store = Store::create(test_config(dir.path())).await.unwrap();
    assert_eq!(store.node_id(), node_id);
    assert_eq!(store.get(b"k").unwrap(), b"v");
    assert!(wait_for_leader(&store, 5000).await);
    store.set(b"k2", b"v2").await.unwrap();
    assert_eq!(store.get(b"k2").unwrap(), b"v2");

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn manual_snapshot_is_persisted() {
    let dir = TempDir::new().unwrap();
    let store = Store::create(test_config(dir.path())).await.unwrap();
    assert!(wait_for_leader(&store, 5000).await);

    for i in 0..20u32 {
        store
            .set(format!("key-{i}").as_bytes(), &i.to_be_bytes())
            .await
            .unwrap();
    }
    store.snapshot().await.unwrap();

    let snapshots = dir.path().join("snapshots");
    let built = wait_until(5000, || {
        let snapshots = snapshots.clone();
        async move {
            std::fs::read_dir(&snapshots)
                .map(|entries| {
                    entries
                        .filter_map(Result::ok)
                        .any(|e| e.path().join("state.bin").exists())
                })
                .unwrap_or(false)
        }
    })
    .await;
    assert!(built, "snapshot directory written");

    let status = store.status();
    assert_eq!(status.members.len(), 1);
    assert_eq!(status.leader, Some(store.node_id()));
    assert!(status.last_applied.is_some());

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreachable_join_target_fails_create() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path()).with_join_addr("127.0.0.1:1");
    match Store::create(config).await {
        Err(StoreError::Forwarding(_)) => {}
        Err(other) => panic!("expected a forwarding error, got {other}"),
        Ok(_) => panic!("joined through a closed port"),
    }

    // the failed attempt released the directory and left no membership behind
    tokio::time::sleep(Duration::from_millis(300)).await;
    let store = Store::create(test_config(dir.path())).await.unwrap();
    assert!(wait_for_leader(&store, 5000).await);
    store.set(b"k", b"v").await.unwrap();
    store.shutdown().await.unwrap();
}
