//! Object store — per-endpoint byte storage with per-key read/write exclusion
//!
//! Puts and evicts of one object id are serialized; concurrent gets of the
//! same id share the lock. Unrelated ids never contend beyond the brief
//! lock-table lookup.

use super::backend::{MemoryStorage, SledStorage, SpillingStorage, StorageBackend};
use crate::identity::ObjectId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Default upper bound for a single object: 100 MB
pub const MAX_OBJECT_SIZE_DEFAULT: usize = 100_000_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Object too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub struct ObjectStore {
    backend: Box<dyn StorageBackend>,
    max_object_size: usize,
    key_locks: Mutex<HashMap<ObjectId, Arc<RwLock<()>>>>,
}

impl ObjectStore {
    pub fn new(backend: Box<dyn StorageBackend>, max_object_size: usize) -> Self {
        Self {
            backend,
            max_object_size,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Volatile store
    pub fn in_memory(max_object_size: usize) -> Self {
        Self::new(Box::new(MemoryStorage::new()), max_object_size)
    }

    /// sled-backed store rooted at `path`
    pub fn persistent(path: impl AsRef<Path>, max_object_size: usize) -> Result<Self, StoreError> {
        let backend = SledStorage::new(path).map_err(StoreError::Backend)?;
        Ok(Self::new(Box::new(backend), max_object_size))
    }

    /// Volatile store holding at most `max_memory` bytes in memory; the
    /// least recently used objects spill to a scratch tree at `spill_path`
    pub fn spilling(
        max_memory: usize,
        spill_path: impl AsRef<Path>,
        max_object_size: usize,
    ) -> Result<Self, StoreError> {
        let backend = SpillingStorage::new(max_memory, spill_path).map_err(StoreError::Backend)?;
        Ok(Self::new(Box::new(backend), max_object_size))
    }

    pub fn max_object_size(&self) -> usize {
        self.max_object_size
    }

    pub fn is_persistent(&self) -> bool {
        self.backend.is_persistent()
    }

    /// Reject payloads above the configured limit
    pub fn check_size(&self, size: usize) -> Result<(), StoreError> {
        if size > self.max_object_size {
            return Err(StoreError::TooLarge {
                size,
                max: self.max_object_size,
            });
        }
        Ok(())
    }

    /// Store `bytes`, generating an id when none is given. Re-putting the
    /// same id overwrites.
    pub fn put(&self, object_id: Option<ObjectId>, bytes: &[u8]) -> Result<ObjectId, StoreError> {
        self.check_size(bytes.len())?;
        let object_id = object_id.unwrap_or_else(ObjectId::generate);
        self.with_write(&object_id, || {
            self.backend
                .put(object_id.as_str().as_bytes(), bytes)
                .map_err(StoreError::Backend)
        })?;
        debug!("Stored object {} ({} bytes)", object_id, bytes.len());
        Ok(object_id)
    }

    /// `None` when the object does not exist
    pub fn get(&self, object_id: &ObjectId) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_read(object_id, || {
            self.backend
                .get(object_id.as_str().as_bytes())
                .map_err(StoreError::Backend)
        })
    }

    pub fn exists(&self, object_id: &ObjectId) -> Result<bool, StoreError> {
        self.with_read(object_id, || {
            self.backend
                .contains(object_id.as_str().as_bytes())
                .map_err(StoreError::Backend)
        })
    }

    /// Remove the object; a no-op when it is absent
    pub fn evict(&self, object_id: &ObjectId) -> Result<(), StoreError> {
        self.with_write(object_id, || {
            self.backend
                .remove(object_id.as_str().as_bytes())
                .map_err(StoreError::Backend)
        })?;
        debug!("Evicted object {}", object_id);
        Ok(())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        self.backend.len().map_err(StoreError::Backend)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush().map_err(StoreError::Backend)
    }

    fn key_lock(&self, object_id: &ObjectId) -> Arc<RwLock<()>> {
        self.key_locks
            .lock()
            .entry(object_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    // Drops the table entry once no other caller holds it. Cloning out of the
    // table needs the table lock, so a count of 2 (table + ours) is stable here.
    fn release_key_lock(&self, object_id: &ObjectId, lock: Arc<RwLock<()>>) {
        let mut table = self.key_locks.lock();
        if Arc::strong_count(&lock) == 2 {
            table.remove(object_id);
        }
    }

    fn with_read<R>(&self, object_id: &ObjectId, f: impl FnOnce() -> R) -> R {
        let lock = self.key_lock(object_id);
        let result = {
            let _guard = lock.read();
            f()
        };
        self.release_key_lock(object_id, lock);
        result
    }

    fn with_write<R>(&self, object_id: &ObjectId, f: impl FnOnce() -> R) -> R {
        let lock = self.key_lock(object_id);
        let result = {
            let _guard = lock.write();
            f()
        };
        self.release_key_lock(object_id, lock);
        result
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.key_locks.lock().len()
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("max_object_size", &self.max_object_size)
            .field("persistent", &self.is_persistent())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    #[test]
    fn test_put_get_roundtrip() {
        let store = ObjectStore::in_memory(1024);
        let id = store.put(Some("1".into()), b"hello").unwrap();
        assert_eq!(id.as_str(), "1");
        assert_eq!(store.get(&id).unwrap(), Some(b"hello".to_vec()));
        assert!(store.exists(&id).unwrap());
    }

    #[test]
    fn test_put_generates_id() {
        let store = ObjectStore::in_memory(1024);
        let a = store.put(None, b"a").unwrap();
        let b = store.put(None, b"b").unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_missing_is_not_error() {
        let store = ObjectStore::in_memory(1024);
        let id = ObjectId::from("nope");
        assert_eq!(store.get(&id).unwrap(), None);
        assert!(!store.exists(&id).unwrap());
        store.evict(&id).unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_evict_then_miss() {
        let store = ObjectStore::in_memory(1024);
        let id = store.put(None, b"data").unwrap();
        store.evict(&id).unwrap();
        store.evict(&id).unwrap();
        assert_eq!(store.get(&id).unwrap(), None);
    }

    #[test]
    fn test_too_large_rejected() {
        let store = ObjectStore::in_memory(4);
        assert_eq!(
            store.put(None, b"12345"),
            Err(StoreError::TooLarge { size: 5, max: 4 })
        );
        assert!(store.put(None, b"1234").is_ok());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_key_locks_released() {
        let store = Arc::new(ObjectStore::in_memory(1024));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for j in 0..50 {
                        let id = ObjectId::new(format!("k{}", j % 4));
                        store.put(Some(id.clone()), &[i as u8; 16]).unwrap();
                        let bytes = store.get(&id).unwrap().unwrap();
                        // A put is never observed half-written
                        assert!(bytes.iter().all(|b| *b == bytes[0]));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.tracked_keys(), 0);
        assert_eq!(store.len().unwrap(), 4);
    }

    #[test]
    fn test_spilling_store_keeps_every_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::spilling(256, dir.path().join("spill"), 1024).unwrap();
        assert!(!store.is_persistent());
        for i in 0..20u8 {
            store.put(Some(ObjectId::new(format!("obj-{}", i))), &[i; 100]).unwrap();
        }
        assert_eq!(store.len().unwrap(), 20);
        for i in (0..20u8).rev() {
            assert_eq!(
                store.get(&ObjectId::new(format!("obj-{}", i))).unwrap(),
                Some(vec![i; 100])
            );
        }
        store.evict(&ObjectId::new("obj-3")).unwrap();
        assert!(!store.exists(&ObjectId::new("obj-3")).unwrap());
        assert_eq!(store.len().unwrap(), 19);
        // The size limit still applies on top of the memory cap
        assert_eq!(
            store.put(None, &[0; 1025]),
            Err(StoreError::TooLarge { size: 1025, max: 1024 })
        );
    }

    proptest! {
        #[test]
        fn prop_put_with_fixed_id_is_idempotent(bytes in proptest::collection::vec(any::<u8>(), 0..512), repeats in 1usize..4) {
            let store = ObjectStore::in_memory(1024);
            let id = ObjectId::from("fixed");
            for _ in 0..repeats {
                store.put(Some(id.clone()), &bytes).unwrap();
            }
            prop_assert_eq!(store.get(&id).unwrap(), Some(bytes));
            prop_assert_eq!(store.len().unwrap(), 1);
        }
    }
}
