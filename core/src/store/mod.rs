// Store module — object persistence for a single endpoint

pub mod backend;
pub mod object_store;

pub use backend::{MemoryStorage, SledStorage, SpillingStorage, StorageBackend};
pub use object_store::{ObjectStore, StoreError, MAX_OBJECT_SIZE_DEFAULT};
