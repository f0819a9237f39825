//! Peer channel lifecycle: sharing, glare, idle teardown and shutdown
//!
//! Run with: cargo test --test integration_peer_lifecycle

use futures::future::join_all;
use peerstore_core::peer::{PeerConfig, PeerError, PeerManager, PeerState};
use peerstore_core::relay::{RelayClient, RelayClientConfig, RelayServer, RelayServerHandle};
use peerstore_core::router::{LocalRequestHandler, RequestRouter, RouterConfig};
use peerstore_core::{EndpointId, Key, ObjectStore};
use std::sync::Arc;
use std::time::Duration;

struct Node {
    id: EndpointId,
    store: Arc<ObjectStore>,
    peers: Arc<PeerManager>,
    relay: Arc<RelayClient>,
}

impl Node {
    async fn start(name: &str, relay: &RelayServerHandle, config: PeerConfig) -> Self {
        let id = EndpointId::generate();
        let client = Arc::new(RelayClient::start(
            id,
            name.to_string(),
            RelayClientConfig {
                relay_address: relay.local_addr().to_string(),
                ..RelayClientConfig::default()
            },
        ));
        client.wait_connected(Duration::from_secs(5)).await.unwrap();

        let store = Arc::new(ObjectStore::in_memory(1024 * 1024));
        let handler = Arc::new(LocalRequestHandler::new(Arc::clone(&store)));
        let peers = Arc::new(
            PeerManager::start(id, config, Arc::clone(&client), handler)
                .await
                .unwrap(),
        );
        Self {
            id,
            store,
            peers,
            relay: client,
        }
    }

    fn router(&self) -> RequestRouter {
        RequestRouter::new(
            self.id,
            Arc::clone(&self.store),
            Some(Arc::clone(&self.peers)),
            RouterConfig {
                request_timeout: Duration::from_secs(5),
                ..RouterConfig::default()
            },
        )
    }

    async fn stop(self) {
        self.peers.shutdown().await;
        self.relay.close().await;
    }
}

fn fast_config() -> PeerConfig {
    PeerConfig {
        listen_address: "127.0.0.1:0".parse().unwrap(),
        negotiation_timeout: Duration::from_secs(3),
        ..PeerConfig::default()
    }
}

async fn start_relay() -> RelayServerHandle {
    Arc::new(RelayServer::new())
        .start("127.0.0.1:0")
        .await
        .unwrap()
}

#[tokio::test]
async fn test_concurrent_get_channel_returns_one_channel() {
    let relay = start_relay().await;
    let a = Node::start("alpha", &relay, fast_config()).await;
    let b = Node::start("beta", &relay, fast_config()).await;

    let channels = join_all((0..8).map(|_| b.peers.get_channel(a.id, Duration::from_secs(5)))).await;
    let ids: Vec<u64> = channels
        .into_iter()
        .map(|channel| channel.unwrap().channel_id())
        .collect();
    assert!(ids.iter().all(|id| *id == ids[0]));

    let stats = b.peers.get_stats();
    assert_eq!(stats.negotiations_started, 1);
    assert_eq!(stats.channels_opened, 1);
    assert_eq!(b.peers.peer_state(&a.id), Some(PeerState::Connected));

    a.stop().await;
    b.stop().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn test_simultaneous_dials_leave_each_side_a_channel() {
    let relay = start_relay().await;
    let a = Node::start("alpha", &relay, fast_config()).await;
    let b = Node::start("beta", &relay, fast_config()).await;

    let (from_a, from_b) = tokio::join!(
        a.peers.get_channel(b.id, Duration::from_secs(5)),
        b.peers.get_channel(a.id, Duration::from_secs(5)),
    );
    assert_eq!(from_a.unwrap().peer_id(), b.id);
    assert_eq!(from_b.unwrap().peer_id(), a.id);

    for node in [&a, &b] {
        let stats = node.peers.get_stats();
        assert_eq!(stats.channels_opened, 1);
        assert_eq!(stats.channels_accepted, 1);
    }

    // Both directions carry traffic
    a.store.put(Some("x".into()), b"from a").unwrap();
    b.store.put(Some("y".into()), b"from b").unwrap();
    assert_eq!(
        b.router().get(&Key::new(a.id, "x")).await.unwrap(),
        Some(b"from a".to_vec())
    );
    assert_eq!(
        a.router().get(&Key::new(b.id, "y")).await.unwrap(),
        Some(b"from b".to_vec())
    );

    a.stop().await;
    b.stop().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn test_idle_channel_torn_down_then_renegotiated() {
    let relay = start_relay().await;
    let idle = PeerConfig {
        idle_timeout: Duration::from_millis(200),
        reap_interval: Duration::from_millis(50),
        ..fast_config()
    };
    let a = Node::start("alpha", &relay, idle.clone()).await;
    let b = Node::start("beta", &relay, idle).await;

    a.store.put(Some("1".into()), b"hello").unwrap();
    let key = Key::new(a.id, "1");
    let router = b.router();
    assert_eq!(router.get(&key).await.unwrap(), Some(b"hello".to_vec()));
    assert_eq!(b.peers.get_stats().negotiations_started, 1);

    tokio::time::sleep(Duration::from_millis(800)).await;
    let (a_stats, b_stats) = (a.peers.get_stats(), b.peers.get_stats());
    assert!(a_stats.channels_closed_idle + b_stats.channels_closed_idle >= 1);
    assert_eq!(a_stats.active_channels, 0);
    assert_eq!(b_stats.active_channels, 0);
    assert_eq!(b.peers.peer_state(&a.id), None);

    assert_eq!(router.get(&key).await.unwrap(), Some(b"hello".to_vec()));
    assert_eq!(b.peers.get_stats().negotiations_started, 2);

    a.stop().await;
    b.stop().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_peer_fails_fast() {
    let relay = start_relay().await;
    let b = Node::start("beta", &relay, fast_config()).await;

    let ghost = EndpointId::generate();
    let started = std::time::Instant::now();
    let err = b
        .peers
        .get_channel(ghost, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err, PeerError::PeerUnreachable(ghost));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(b.peers.get_stats().negotiations_failed, 1);
    assert_eq!(b.peers.peer_state(&ghost), None);

    b.stop().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_channels_and_refuses_new_ones() {
    let relay = start_relay().await;
    let a = Node::start("alpha", &relay, fast_config()).await;
    let b = Node::start("beta", &relay, fast_config()).await;

    let channel = b
        .peers
        .get_channel(a.id, Duration::from_secs(5))
        .await
        .unwrap();
    b.peers.shutdown().await;
    assert!(channel.is_closed());
    assert_eq!(
        b.peers
            .get_channel(a.id, Duration::from_secs(1))
            .await
            .unwrap_err(),
        PeerError::ConnectionClosed
    );
    assert_eq!(b.peers.get_stats().active_channels, 0);

    a.stop().await;
    b.stop().await;
    relay.shutdown().await;
}
