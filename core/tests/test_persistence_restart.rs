use peerstore_core::{Endpoint, EndpointConfig, EndpointId, Key, ObjectStore};

#[test]
fn test_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("objects");

    // First instance: store two objects and evict one
    {
        let store = ObjectStore::persistent(&path, 1024).unwrap();
        store.put(Some("keep".into()), b"kept bytes").unwrap();
        store.put(Some("drop".into()), b"evicted").unwrap();
        store.evict(&"drop".into()).unwrap();
        store.flush().unwrap();
    }
    // store dropped here; sled releases the directory

    // Second instance: verify data survived
    {
        let store = ObjectStore::persistent(&path, 1024).unwrap();
        assert!(store.is_persistent());
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(
            store.get(&"keep".into()).unwrap(),
            Some(b"kept bytes".to_vec())
        );
        assert!(!store.exists(&"drop".into()).unwrap());
    }
}

#[tokio::test]
async fn test_endpoint_keys_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = EndpointConfig {
        endpoint_id: Some(EndpointId::generate()),
        storage_path: Some(dir.path().join("store")),
        ..EndpointConfig::new("durable")
    };

    let key = {
        let endpoint = Endpoint::start(config.clone()).await.unwrap();
        let key = endpoint.put(b"hello".to_vec(), None).await.unwrap();
        endpoint.close().await.unwrap();
        key
    };

    let endpoint = Endpoint::start(config).await.unwrap();
    assert_eq!(endpoint.id(), key.owner);
    assert_eq!(endpoint.get(&key).await.unwrap(), Some(b"hello".to_vec()));
    assert!(!endpoint.exists(&Key::new(key.owner, "other")).await.unwrap());
    endpoint.close().await.unwrap();
}
