//! Request Router — sends each operation to the store of the key's owner
//!
//! Keys owned by this endpoint go straight to the local ObjectStore. Keys
//! owned by another endpoint travel as a RequestEnvelope over a peer channel
//! obtained from the PeerManager. A timed-out or dropped attempt is retried
//! with exponential backoff; every other failure surfaces at once.

use crate::backoff::Backoff;
use crate::identity::{EndpointId, Key, ObjectId};
use crate::message::{Operation, ResponseEnvelope, ResponseStatus};
use crate::peer::{PeerError, PeerManager};
use crate::store::ObjectStore;
use crate::PeerStoreError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Extra attempts after a timed-out or dropped request
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Per-attempt budget used by the typed helpers
    pub request_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(5), 0.0),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// What an operation produced. Misses are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The object exists or the operation completed; GET carries the bytes
    Found(Option<Vec<u8>>),
    /// No object under the key
    NotFound,
}

pub struct RequestRouter {
    local_id: EndpointId,
    store: Arc<ObjectStore>,
    peers: Option<Arc<PeerManager>>,
    config: RouterConfig,
}

impl RequestRouter {
    pub fn new(
        local_id: EndpointId,
        store: Arc<ObjectStore>,
        peers: Option<Arc<PeerManager>>,
        config: RouterConfig,
    ) -> Self {
        Self {
            local_id,
            store,
            peers,
            config,
        }
    }

    pub fn local_id(&self) -> EndpointId {
        self.local_id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Run one operation against the owner of `key`. `timeout` bounds each attempt.
    pub async fn execute(
        &self,
        operation: Operation,
        key: &Key,
        payload: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Outcome, PeerStoreError> {
        if operation == Operation::Put && payload.is_none() {
            return Err(PeerStoreError::InvalidInput("PUT requires a payload".to_string()));
        }
        if key.owner == self.local_id {
            self.execute_local(operation, key, payload).await
        } else {
            self.execute_remote(operation, key, payload, timeout).await
        }
    }

    /// Store calls may hit disk, so they run on the blocking pool
    async fn execute_local(
        &self,
        operation: Operation,
        key: &Key,
        payload: Option<Vec<u8>>,
    ) -> Result<Outcome, PeerStoreError> {
        let store = Arc::clone(&self.store);
        let object_id = key.object_id.clone();
        tokio::task::spawn_blocking(move || apply_local(&store, operation, &object_id, payload))
            .await
            .map_err(|e| PeerStoreError::Storage(format!("store task failed: {}", e)))?
    }

    async fn execute_remote(
        &self,
        operation: Operation,
        key: &Key,
        payload: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Outcome, PeerStoreError> {
        let size = payload.as_ref().map_or(0, |p| p.len());
        if operation == Operation::Put {
            self.store.check_size(size)?;
        }
        let peers = self
            .peers
            .as_ref()
            .ok_or(PeerStoreError::PeeringUnavailable)?;

        let attempts = self.config.max_retries + 1;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff.delay(attempt - 1)).await;
            }
            if peers.is_shut_down() {
                return Err(PeerStoreError::ConnectionClosed);
            }
            match self
                .attempt(peers, operation, key, payload.clone(), timeout)
                .await
            {
                Ok(response) => return response_outcome(operation, key, response, size),
                Err(e) if e.is_transient() => {
                    debug!(
                        "{} {} attempt {}/{} failed: {}",
                        operation,
                        key,
                        attempt + 1,
                        attempts,
                        e
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!("{} {} gave up after {} attempts", operation, key, attempts);
        Err(PeerStoreError::RequestTimeout { attempts })
    }

    /// One channel lookup plus one request, both inside `timeout`
    async fn attempt(
        &self,
        peers: &PeerManager,
        operation: Operation,
        key: &Key,
        payload: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, PeerError> {
        let deadline = Instant::now() + timeout;
        let channel = peers.get_channel(key.owner, timeout).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PeerError::Timeout);
        }
        channel
            .request(operation, key.object_id.clone(), payload, remaining)
            .await
    }

    pub async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, PeerStoreError> {
        match self
            .execute(Operation::Get, key, None, self.config.request_timeout)
            .await?
        {
            Outcome::Found(bytes) => Ok(bytes),
            Outcome::NotFound => Ok(None),
        }
    }

    pub async fn put(&self, key: &Key, bytes: Vec<u8>) -> Result<(), PeerStoreError> {
        self.execute(Operation::Put, key, Some(bytes), self.config.request_timeout)
            .await
            .map(|_| ())
    }

    pub async fn exists(&self, key: &Key) -> Result<bool, PeerStoreError> {
        let outcome = self
            .execute(Operation::Exists, key, None, self.config.request_timeout)
            .await?;
        Ok(matches!(outcome, Outcome::Found(_)))
    }

    /// Evicting a missing key is a no-op
    pub async fn evict(&self, key: &Key) -> Result<(), PeerStoreError> {
        self.execute(Operation::Evict, key, None, self.config.request_timeout)
            .await
            .map(|_| ())
    }
}

fn apply_local(
    store: &ObjectStore,
    operation: Operation,
    object_id: &ObjectId,
    payload: Option<Vec<u8>>,
) -> Result<Outcome, PeerStoreError> {
    let outcome = match operation {
        Operation::Get => match store.get(object_id)? {
            Some(bytes) => Outcome::Found(Some(bytes)),
            None => Outcome::NotFound,
        },
        Operation::Put => {
            let bytes = payload.unwrap_or_default();
            store.put(Some(object_id.clone()), &bytes)?;
            Outcome::Found(None)
        }
        Operation::Exists => {
            if store.exists(object_id)? {
                Outcome::Found(None)
            } else {
                Outcome::NotFound
            }
        }
        Operation::Evict => {
            store.evict(object_id)?;
            Outcome::Found(None)
        }
    };
    Ok(outcome)
}

fn response_outcome(
    operation: Operation,
    key: &Key,
    response: ResponseEnvelope,
    size: usize,
) -> Result<Outcome, PeerStoreError> {
    match response.status {
        ResponseStatus::Ok if operation == Operation::Get => match response.payload {
            Some(bytes) => Ok(Outcome::Found(Some(bytes))),
            None => Err(PeerStoreError::RemoteError(format!(
                "GET {} answered without a payload",
                key
            ))),
        },
        ResponseStatus::Ok => Ok(Outcome::Found(None)),
        // Evicting a missing key is not a miss
        ResponseStatus::NotFound if operation == Operation::Evict => Ok(Outcome::Found(None)),
        ResponseStatus::NotFound => Ok(Outcome::NotFound),
        ResponseStatus::TooLarge => Err(PeerStoreError::ObjectTooLarge {
            size: response.size.map_or(size, |s| s as usize),
            max: response.limit.unwrap_or(0) as usize,
        }),
        ResponseStatus::Error => Err(PeerStoreError::RemoteError(
            response
                .message
                .unwrap_or_else(|| "unspecified remote error".to_string()),
        )),
    }
}

// ============================================================================
// TESTS
// ============================================================================
