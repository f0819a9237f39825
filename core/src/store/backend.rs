// Storage abstraction for object bytes: volatile map, sled on disk, or a
// bounded memory tier that spills to sled

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Byte-blob storage keyed by object id
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String>;
    fn contains(&self, key: &[u8]) -> Result<bool, String>;
    fn remove(&self, key: &[u8]) -> Result<(), String>;
    fn len(&self) -> Result<usize, String>;
    fn flush(&self) -> Result<(), String>;
    /// Whether entries survive a process restart
    fn is_persistent(&self) -> bool;
}

/// In-memory storage; contents are lost on shutdown
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        Ok(self.data.read().get(key).cloned())
    }

    fn contains(&self, key: &[u8]) -> Result<bool, String> {
        Ok(self.data.read().contains_key(key))
    }

    fn remove(&self, key: &[u8]) -> Result<(), String> {
        self.data.write().remove(key);
        Ok(())
    }

    fn len(&self) -> Result<usize, String> {
        Ok(self.data.read().len())
    }

    fn flush(&self) -> Result<(), String> {
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

/// sled-backed storage that survives restarts
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn new(path: impl AsRef<Path>) -> std::result::Result<Self, String> {
        let db = sled::open(path).map_err(|e| e.to_string())?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.db.insert(key, value).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        let value = self.db.get(key).map_err(|e| e.to_string())?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn contains(&self, key: &[u8]) -> Result<bool, String> {
        self.db.contains_key(key).map_err(|e| e.to_string())
    }

    fn remove(&self, key: &[u8]) -> Result<(), String> {
        self.db.remove(key).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn len(&self) -> Result<usize, String> {
        Ok(self.db.len())
    }

    fn flush(&self) -> Result<(), String> {
        self.db.flush().map_err(|e| e.to_string())?;
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

/// Memory tier capped at `max_memory` bytes. The least recently used objects
/// are moved to a temporary sled tree to make room and come back to memory
/// when read. Objects larger than the cap live in the spill tier only.
/// Nothing survives a restart.
pub struct SpillingStorage {
    max_memory: usize,
    tiers: Mutex<Tiers>,
    spill: sled::Db,
}

#[derive(Default)]
struct Tiers {
    /// key -> (value, last use)
    memory: HashMap<Vec<u8>, (Vec<u8>, u64)>,
    /// last use -> key, oldest first
    recency: BTreeMap<u64, Vec<u8>>,
    used: usize,
    clock: u64,
}

impl Tiers {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn take(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let (value, last_use) = self.memory.remove(key)?;
        self.recency.remove(&last_use);
        self.used -= value.len();
        Some(value)
    }

    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        let now = self.tick();
        self.used += value.len();
        self.recency.insert(now, key.clone());
        self.memory.insert(key, (value, now));
    }
}

impl SpillingStorage {
    /// The spill tree is created at `spill_path` and removed when dropped
    pub fn new(max_memory: usize, spill_path: impl AsRef<Path>) -> std::result::Result<Self, String> {
        let spill = sled::Config::new()
            .path(spill_path)
            .temporary(true)
            .open()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            max_memory,
            tiers: Mutex::new(Tiers::default()),
            spill,
        })
    }

    /// Bytes currently held in memory
    pub fn memory_used(&self) -> usize {
        self.tiers.lock().used
    }

    /// Objects currently in the spill tier
    pub fn spilled(&self) -> usize {
        self.spill.len()
    }

    /// Spill least recently used objects until `needed` more bytes fit
    fn make_space(&self, tiers: &mut Tiers, needed: usize) -> Result<(), String> {
        while tiers.used + needed > self.max_memory {
            let Some((_, key)) = tiers.recency.pop_first() else {
                break;
            };
            if let Some((value, _)) = tiers.memory.remove(&key) {
                tiers.used -= value.len();
                self.spill.insert(key, value).map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }

    fn admit(&self, tiers: &mut Tiers, key: &[u8], value: Vec<u8>) -> Result<(), String> {
        if value.len() > self.max_memory {
            self.spill.insert(key, value).map_err(|e| e.to_string())?;
            return Ok(());
        }
        self.make_space(tiers, value.len())?;
        tiers.insert(key.to_vec(), value);
        Ok(())
    }
}

impl StorageBackend for SpillingStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        let mut tiers = self.tiers.lock();
        tiers.take(key);
        self.spill.remove(key).map_err(|e| e.to_string())?;
        self.admit(&mut tiers, key, value.to_vec())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        let mut tiers = self.tiers.lock();
        if let Some(value) = tiers.take(key) {
            let copy = value.clone();
            tiers.insert(key.to_vec(), value);
            return Ok(Some(copy));
        }
        let Some(spilled) = self.spill.get(key).map_err(|e| e.to_string())? else {
            return Ok(None);
        };
        let value = spilled.to_vec();
        if value.len() <= self.max_memory {
            self.spill.remove(key).map_err(|e| e.to_string())?;
            self.admit(&mut tiers, key, value.clone())?;
        }
        Ok(Some(value))
    }

    fn contains(&self, key: &[u8]) -> Result<bool, String> {
        let tiers = self.tiers.lock();
        if tiers.memory.contains_key(key) {
            return Ok(true);
        }
        self.spill.contains_key(key).map_err(|e| e.to_string())
    }

    fn remove(&self, key: &[u8]) -> Result<(), String> {
        let mut tiers = self.tiers.lock();
        tiers.take(key);
        self.spill.remove(key).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn len(&self) -> Result<usize, String> {
        let tiers = self.tiers.lock();
        Ok(tiers.memory.len() + self.spill.len())
    }

    fn flush(&self) -> Result<(), String> {
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
