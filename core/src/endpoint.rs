//! Endpoint — one participant in the object exchange
//!
//! Owns the local object store and, when a relay is configured, the relay
//! client and peer manager that let it reach objects owned elsewhere. Every
//! client call is a single routed operation with the configured timeout.

use crate::identity::{validate_name, EndpointId, EndpointIdentity, Key, ObjectId};
use crate::peer::{PeerConfig, PeerManager};
use crate::relay::{RelayClient, RelayClientConfig, RelayClientError};
use crate::router::{LocalRequestHandler, RequestRouter, RouterConfig};
use crate::store::{ObjectStore, MAX_OBJECT_SIZE_DEFAULT};
use crate::PeerStoreError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Persistable endpoint settings. Durations are plain integers so the
/// config file stays readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub name: String,
    /// Stable id; generated at start when absent
    pub endpoint_id: Option<EndpointId>,
    /// Peer listener bind address
    pub listen_address: SocketAddr,
    /// Extra addresses offered to peers during negotiation
    pub advertised_addresses: Vec<SocketAddr>,
    /// `host:port` of the relay; solo mode when absent
    pub relay_address: Option<String>,
    /// Token presented to the relay at registration
    pub credentials: Option<String>,
    /// sled directory; in-memory store when absent
    pub storage_path: Option<PathBuf>,
    /// Cap on bytes an in-memory store keeps resident; needs `spill_path`
    pub max_memory: Option<usize>,
    /// Scratch directory for objects pushed out of memory
    pub spill_path: Option<PathBuf>,
    pub max_object_size: usize,
    /// Peer requests served at once
    pub max_concurrent_requests: usize,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub negotiation_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// How long `start` waits for the relay to confirm registration
    pub relay_wait_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "endpoint".to_string(),
            endpoint_id: None,
            listen_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertised_addresses: Vec::new(),
            relay_address: None,
            credentials: None,
            storage_path: None,
            max_memory: None,
            spill_path: None,
            max_object_size: MAX_OBJECT_SIZE_DEFAULT,
            max_concurrent_requests: 64,
            request_timeout_ms: 30_000,
            max_retries: 3,
            negotiation_timeout_ms: 10_000,
            idle_timeout_secs: 300,
            heartbeat_interval_secs: 15,
            relay_wait_ms: 5_000,
        }
    }
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), PeerStoreError> {
        validate_name(&self.name)?;
        if self.max_object_size == 0 {
            return Err(PeerStoreError::InvalidInput(
                "max_object_size must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(PeerStoreError::InvalidInput(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        match (&self.max_memory, &self.spill_path) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(PeerStoreError::InvalidInput(
                    "max_memory and spill_path must be set together".to_string(),
                ))
            }
            (Some(_), Some(_)) if self.storage_path.is_some() => {
                return Err(PeerStoreError::InvalidInput(
                    "max_memory applies only to in-memory stores".to_string(),
                ))
            }
            _ => {}
        }
        if let Some(relay) = &self.relay_address {
            validate_relay_address(relay)?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            listen_address: self.listen_address,
            advertised_addresses: self.advertised_addresses.clone(),
            negotiation_timeout: Duration::from_millis(self.negotiation_timeout_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_object_size: self.max_object_size,
            max_concurrent_requests: self.max_concurrent_requests,
            ..PeerConfig::default()
        }
    }

    fn relay_config(&self, relay_address: &str) -> RelayClientConfig {
        RelayClientConfig {
            relay_address: relay_address.to_string(),
            credentials: self.credentials.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            ..RelayClientConfig::default()
        }
    }

    fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_retries: self.max_retries,
            request_timeout: self.request_timeout(),
            ..RouterConfig::default()
        }
    }
}

/// Accepts `host:port` with an optional `tcp://` prefix
pub fn validate_relay_address(address: &str) -> Result<(), PeerStoreError> {
    let address = address.strip_prefix("tcp://").unwrap_or(address);
    let valid = address
        .rsplit_once(':')
        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().map_or(false, |p| p > 0))
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(PeerStoreError::InvalidInput(format!(
            "relay address {:?} is not host:port",
            address
        )))
    }
}

pub struct Endpoint {
    identity: EndpointIdentity,
    config: EndpointConfig,
    store: Arc<ObjectStore>,
    relay: Option<Arc<RelayClient>>,
    peers: Option<Arc<PeerManager>>,
    router: RequestRouter,
    closed: AtomicBool,
}

impl Endpoint {
    /// Open the store and, with a relay configured, start peering.
    ///
    /// Fails with `RegistrationRejected` when the relay refuses this endpoint.
    /// An unreachable relay is not fatal; the client keeps reconnecting.
    pub async fn start(config: EndpointConfig) -> Result<Self, PeerStoreError> {
        config.validate()?;
        let endpoint_id = config.endpoint_id.unwrap_or_else(EndpointId::generate);

        let store = Arc::new(match (&config.storage_path, config.max_memory, &config.spill_path) {
            (Some(path), _, _) => ObjectStore::persistent(path, config.max_object_size)?,
            (None, Some(max_memory), Some(spill)) => {
                ObjectStore::spilling(max_memory, spill, config.max_object_size)?
            }
            _ => ObjectStore::in_memory(config.max_object_size),
        });

        let (relay, peers, listen_address) = match &config.relay_address {
            Some(relay_address) => {
                let relay = Arc::new(RelayClient::start(
                    endpoint_id,
                    config.name.clone(),
                    config.relay_config(relay_address),
                ));
                let handler = Arc::new(LocalRequestHandler::new(Arc::clone(&store)));
                let peers = Arc::new(
                    PeerManager::start(
                        endpoint_id,
                        config.peer_config(),
                        Arc::clone(&relay),
                        handler,
                    )
                    .await?,
                );
                match relay
                    .wait_connected(Duration::from_millis(config.relay_wait_ms))
                    .await
                {
                    Ok(()) => {}
                    Err(RelayClientError::Timeout) => {
                        warn!(
                            "Endpoint {}: relay {} not reachable yet, retrying in background",
                            config.name, relay_address
                        );
                    }
                    Err(e) => {
                        peers.shutdown().await;
                        relay.close().await;
                        return Err(e.into());
                    }
                }
                let listen_address = peers.local_addr();
                (Some(relay), Some(peers), listen_address)
            }
            None => (None, None, config.listen_address),
        };

        let identity = EndpointIdentity::new(
            endpoint_id,
            config.name.clone(),
            listen_address,
            config.relay_address.clone(),
        )?;
        let router = RequestRouter::new(
            endpoint_id,
            Arc::clone(&store),
            peers.clone(),
            config.router_config(),
        );
        info!(
            "Endpoint {} started as {} ({}, {})",
            identity.display_name,
            endpoint_id,
            if store.is_persistent() { "persistent" } else { "in-memory" },
            if peers.is_some() { "peering" } else { "solo" }
        );

        Ok(Self {
            identity,
            config,
            store,
            relay,
            peers,
            router,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> EndpointId {
        self.identity.endpoint_id
    }

    pub fn identity(&self) -> &EndpointIdentity {
        &self.identity
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub fn peer_manager(&self) -> Option<&Arc<PeerManager>> {
        self.peers.as_ref()
    }

    pub fn relay_client(&self) -> Option<&Arc<RelayClient>> {
        self.relay.as_ref()
    }

    pub async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, PeerStoreError> {
        self.router.get(key).await
    }

    /// Store `bytes` under `key`, or under a fresh local key when `None`
    pub async fn put(&self, bytes: Vec<u8>, key: Option<Key>) -> Result<Key, PeerStoreError> {
        let key = key.unwrap_or_else(|| Key::new(self.id(), ObjectId::generate()));
        self.router.put(&key, bytes).await?;
        Ok(key)
    }

    /// Store `bytes` locally under a chosen object id
    pub async fn put_with_id(
        &self,
        object_id: impl Into<ObjectId>,
        bytes: Vec<u8>,
    ) -> Result<Key, PeerStoreError> {
        self.put(bytes, Some(Key::new(self.id(), object_id))).await
    }

    pub async fn exists(&self, key: &Key) -> Result<bool, PeerStoreError> {
        self.router.exists(key).await
    }

    pub async fn evict(&self, key: &Key) -> Result<(), PeerStoreError> {
        self.router.evict(key).await
    }

    /// Tear down peer channels and the relay session, then flush the store
    pub async fn close(&self) -> Result<(), PeerStoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(peers) = &self.peers {
            peers.shutdown().await;
        }
        if let Some(relay) = &self.relay {
            relay.close().await;
        }
        self.store.flush()?;
        info!("Endpoint {} closed", self.identity.display_name);
        Ok(())
    }
}

/// Reference to an object that may live on another endpoint. The bytes are
/// fetched on the first successful `resolve` and reused afterwards.
#[derive(Debug)]
pub struct ObjectRef {
    key: Key,
    cached: Mutex<Option<Vec<u8>>>,
}

impl ObjectRef {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            cached: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn is_resolved(&self) -> bool {
        self.cached.lock().is_some()
    }

    /// Fetch through `endpoint` unless already cached. A miss is not cached.
    pub async fn resolve(&self, endpoint: &Endpoint) -> Result<Option<Vec<u8>>, PeerStoreError> {
        if let Some(bytes) = self.cached.lock().clone() {
            return Ok(Some(bytes));
        }
        let fetched = endpoint.get(&self.key).await?;
        if let Some(bytes) = &fetched {
            *self.cached.lock() = Some(bytes.clone());
        }
        Ok(fetched)
    }
}

// ============================================================================
// TESTS
// ============================================================================
