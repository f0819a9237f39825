// Inbound request handling — applies peer requests to the local object store
//
// Store calls may touch disk, so they run on the blocking pool and never on
// the async workers that drive peer channels.

use crate::identity::EndpointId;
use crate::message::{Operation, RequestEnvelope, ResponseEnvelope};
use crate::peer::RequestHandler;
use crate::store::{ObjectStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Serves GET/PUT/EXISTS/EVICT requests from peers against this endpoint's store
pub struct LocalRequestHandler {
    store: Arc<ObjectStore>,
}

impl LocalRequestHandler {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self { store }
    }

    fn apply(store: &ObjectStore, request: RequestEnvelope) -> ResponseEnvelope {
        let id = request.request_id;
        let object_id = request.object_id;
        match request.operation {
            Operation::Get => match store.get(&object_id) {
                Ok(Some(bytes)) => ResponseEnvelope::ok(id, Some(bytes)),
                Ok(None) => ResponseEnvelope::not_found(id),
                Err(e) => store_failure(id, e),
            },
            Operation::Put => {
                let Some(bytes) = request.payload else {
                    return ResponseEnvelope::error(id, "PUT without payload");
                };
                match store.put(Some(object_id), &bytes) {
                    Ok(_) => ResponseEnvelope::ok(id, None),
                    Err(e) => store_failure(id, e),
                }
            }
            Operation::Exists => match store.exists(&object_id) {
                Ok(true) => ResponseEnvelope::ok(id, None),
                Ok(false) => ResponseEnvelope::not_found(id),
                Err(e) => store_failure(id, e),
            },
            Operation::Evict => match store.evict(&object_id) {
                Ok(()) => ResponseEnvelope::ok(id, None),
                Err(e) => store_failure(id, e),
            },
        }
    }
}

fn store_failure(request_id: u64, error: StoreError) -> ResponseEnvelope {
    match error {
        StoreError::TooLarge { size, max } => {
            ResponseEnvelope::too_large(request_id, Some(size as u64), max as u64)
        }
        StoreError::Backend(message) => ResponseEnvelope::error(request_id, message),
    }
}

#[async_trait]
impl RequestHandler for LocalRequestHandler {
    async fn handle(&self, from: EndpointId, request: RequestEnvelope) -> ResponseEnvelope {
        debug!(
            "Serving {} {} for {}",
            request.operation,
            request.object_id,
            from.short()
        );
        let id = request.request_id;
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || Self::apply(&store, request)).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Store task for request {} failed: {}", id, e);
                ResponseEnvelope::error(id, "store task failed")
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ObjectId;
    use crate::message::ResponseStatus;
    use crate::store::{MemoryStorage, StorageBackend};

    fn request(operation: Operation, object_id: &str, payload: Option<&[u8]>) -> RequestEnvelope {
        RequestEnvelope {
            request_id: 7,
            operation,
            object_id: ObjectId::new(object_id),
            payload: payload.map(|p| p.to_vec()),
            deadline_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let handler = LocalRequestHandler::new(Arc::new(ObjectStore::in_memory(1024)));
        let from = EndpointId::generate();

        let put = handler
            .handle(from, request(Operation::Put, "1", Some(b"hello")))
            .await;
        assert_eq!(put.status, ResponseStatus::Ok);
        assert_eq!(put.request_id, 7);

        let get = handler.handle(from, request(Operation::Get, "1", None)).await;
        assert_eq!(get.status, ResponseStatus::Ok);
        assert_eq!(get.payload.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let handler = LocalRequestHandler::new(Arc::new(ObjectStore::in_memory(1024)));
        let from = EndpointId::generate();

        let get = handler.handle(from, request(Operation::Get, "999", None)).await;
        assert_eq!(get.status, ResponseStatus::NotFound);
        let exists = handler
            .handle(from, request(Operation::Exists, "999", None))
            .await;
        assert_eq!(exists.status, ResponseStatus::NotFound);
        let evict = handler
            .handle(from, request(Operation::Evict, "999", None))
            .await;
        assert_eq!(evict.status, ResponseStatus::Ok);
    }

    #[tokio::test]
    async fn test_oversized_put_reports_limit() {
        let store = Arc::new(ObjectStore::in_memory(4));
        let handler = LocalRequestHandler::new(Arc::clone(&store));

        let response = handler
            .handle(
                EndpointId::generate(),
                request(Operation::Put, "big", Some(b"too long")),
            )
            .await;
        assert_eq!(response.status, ResponseStatus::TooLarge);
        assert_eq!(response.limit, Some(4));
        assert!(!store.exists(&ObjectId::new("big")).unwrap());
    }

    #[tokio::test]
    async fn test_put_without_payload_is_error() {
        let handler = LocalRequestHandler::new(Arc::new(ObjectStore::in_memory(1024)));
        let response = handler
            .handle(EndpointId::generate(), request(Operation::Put, "1", None))
            .await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(response.message.is_some());
    }

    /// Memory backend whose reads take a while, like a cold disk
    struct SlowReads {
        inner: MemoryStorage,
        delay: std::time::Duration,
    }

    impl StorageBackend for SlowReads {
        fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
            self.inner.put(key, value)
        }
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
            std::thread::sleep(self.delay);
            self.inner.get(key)
        }
        fn contains(&self, key: &[u8]) -> Result<bool, String> {
            self.inner.contains(key)
        }
        fn remove(&self, key: &[u8]) -> Result<(), String> {
            self.inner.remove(key)
        }
        fn len(&self) -> Result<usize, String> {
            self.inner.len()
        }
        fn flush(&self) -> Result<(), String> {
            Ok(())
        }
        fn is_persistent(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_slow_store_does_not_stall_runtime() {
        let backend = SlowReads {
            inner: MemoryStorage::new(),
            delay: std::time::Duration::from_millis(200),
        };
        let handler = LocalRequestHandler::new(Arc::new(ObjectStore::new(Box::new(backend), 1024)));

        // Single-threaded runtime: the ticker only advances if the read is off-thread
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            })
        };

        let response = handler
            .handle(EndpointId::generate(), request(Operation::Get, "cold", None))
            .await;
        ticker.abort();
        assert_eq!(response.status, ResponseStatus::NotFound);
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 5);
    }
}
