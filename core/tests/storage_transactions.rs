//! End-to-end checks of the storage facade across backends and transactions.

use std::time::Duration;

use agentmesh_core::api::{
    BackendKind, EventBus, QueryOptions, StorageOptions, StorageSystem,
};
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn rolled_back_writes_are_invisible() {
    let storage = StorageSystem::new(StorageOptions::default(), None).unwrap();

    storage.begin_transaction().await.unwrap();
    storage.set("a", &json!(1), None).await.unwrap();
    storage.set("b", &json!(2), None).await.unwrap();
    storage.rollback_transaction().await.unwrap();

    assert!(storage
        .keys(&QueryOptions::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn committed_transaction_is_atomic_on_disk() {
    let dir = TempDir::new().unwrap();
    let options = StorageOptions {
        backend: BackendKind::File,
        storage_dir: Some(dir.path().to_string_lossy().into_owned()),
        ..Default::default()
    };

    {
        let storage = StorageSystem::new(options.clone(), None).unwrap();
        storage.set("seed", &json!("old"), None).await.unwrap();

        storage.begin_transaction().await.unwrap();
        storage.set("seed", &json!("new"), None).await.unwrap();
        storage.set("added", &json!(true), None).await.unwrap();
        storage.commit_transaction().await.unwrap();
    }

    // A fresh system over the same directory sees exactly the committed set.
    let storage = StorageSystem::new(options, None).unwrap();
    let seed: Option<String> = storage.get("seed").await.unwrap();
    assert_eq!(seed.as_deref(), Some("new"));
    let added: Option<bool> = storage.get("added").await.unwrap();
    assert_eq!(added, Some(true));
}

#[tokio::test]
async fn transaction_lifecycle_is_observable_on_the_bus() {
    let bus = EventBus::in_memory();
    let storage = StorageSystem::new(StorageOptions::default(), Some(bus.clone())).unwrap();

    storage.begin_transaction().await.unwrap();
    storage.set("k", &json!(1), None).await.unwrap();
    storage.commit_transaction().await.unwrap();

    assert_eq!(bus.get_event_history("storage:transaction:begin").len(), 1);
    assert_eq!(bus.get_event_history("storage:set").len(), 1);
    assert_eq!(bus.get_event_history("storage:transaction:commit").len(), 1);
}

#[tokio::test]
async fn ttl_applies_across_backends() {
    let dir = TempDir::new().unwrap();
    let storage = StorageSystem::new(
        StorageOptions {
            backend: BackendKind::File,
            storage_dir: Some(dir.path().to_string_lossy().into_owned()),
            cache_ttl: Some(Duration::from_millis(30)),
            ..Default::default()
        },
        None,
    )
    .unwrap();

    storage.set("ephemeral", &json!(1), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let got: Option<i64> = storage.get("ephemeral").await.unwrap();
    assert!(got.is_none());
    storage.close();
}
