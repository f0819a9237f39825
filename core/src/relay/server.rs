//! Relay Server — registers endpoint sessions and forwards signaling between them
//!
//! Each accepted connection must REGISTER first. After that, one reader task
//! routes the session's envelopes into the recipients' outbound queues and one
//! writer task drains the session's own queue onto the socket. A session's
//! envelopes are forwarded in the order they were read, so per-sender order
//! is preserved end to end.

use super::auth::{Authenticator, NullAuthenticator, UserId};
use super::protocol::{
    EnvelopeKind, ErrorCode, RelayFrame, SignalingEnvelope, DEFAULT_MAX_MESSAGE_BYTES,
};
use crate::identity::EndpointId;
use crate::message::{read_frame, write_frame, FrameError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum concurrently registered sessions
    pub max_connections: usize,
    /// Frames above this size close the connection
    pub max_message_bytes: usize,
    /// A session silent for this long may be replaced by a new REGISTER
    pub session_stale_after: Duration,
    /// Time a new connection has to send REGISTER
    pub register_timeout: Duration,
    /// Per-session outbound queue depth
    pub outbound_queue: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            session_stale_after: Duration::from_secs(45),
            register_timeout: Duration::from_secs(10),
            outbound_queue: 256,
        }
    }
}

/// Statistics about relay server operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayServerStats {
    pub sessions_active: usize,
    pub envelopes_forwarded: u64,
    pub forwards_failed: u64,
    pub registrations_rejected: u64,
    pub sessions_replaced: u64,
}

/// Relay server error types
#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("Bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("Network error: {0}")]
    NetworkError(String),
}

/// Registry entry for a live session
struct SessionEntry {
    generation: u64,
    user: UserId,
    name: String,
    outbound: mpsc::Sender<RelayFrame>,
    last_seen: Arc<Mutex<Instant>>,
    /// Tells the owning connection task to disconnect
    kick: Arc<Notify>,
}

impl SessionEntry {
    fn is_stale(&self, stale_after: Duration) -> bool {
        self.outbound.is_closed() || self.last_seen.lock().elapsed() > stale_after
    }
}

/// What a connection task holds for its own registered session
struct Session {
    endpoint_id: EndpointId,
    generation: u64,
    user: UserId,
    outbound: mpsc::Sender<RelayFrame>,
    last_seen: Arc<Mutex<Instant>>,
    kick: Arc<Notify>,
}

/// Outcome of routing one envelope
enum Route {
    Deliver(mpsc::Sender<RelayFrame>),
    Bounce(ErrorCode),
}

/// The relay server
pub struct RelayServer {
    config: RelayServerConfig,
    authenticator: Arc<dyn Authenticator>,
    /// Registered sessions: endpoint_id -> session
    sessions: Mutex<HashMap<EndpointId, SessionEntry>>,
    next_generation: AtomicU64,
    stats: RwLock<RelayServerStats>,
}

impl RelayServer {
    /// Create a new relay server with default configuration and no authentication
    pub fn new() -> Self {
        Self::with_config(RelayServerConfig::default())
    }

    pub fn with_config(config: RelayServerConfig) -> Self {
        Self::with_authenticator(config, Arc::new(NullAuthenticator))
    }

    pub fn with_authenticator(
        config: RelayServerConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            config,
            authenticator,
            sessions: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            stats: RwLock::new(RelayServerStats::default()),
        }
    }

    /// Get current server statistics
    pub fn get_stats(&self) -> RelayServerStats {
        let mut stats = self.stats.read().clone();
        stats.sessions_active = self.sessions.lock().len();
        stats
    }

    pub fn is_registered(&self, endpoint_id: &EndpointId) -> bool {
        self.sessions.lock().contains_key(endpoint_id)
    }

    /// Registered endpoints with their display names
    pub fn registered_endpoints(&self) -> Vec<(EndpointId, String)> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.name.clone()))
            .collect()
    }

    /// Admit a session for `endpoint_id`. Check and insert happen under one
    /// registry lock, so at most one live session exists per id.
    fn admit(
        &self,
        endpoint_id: EndpointId,
        user: UserId,
        name: String,
        outbound: mpsc::Sender<RelayFrame>,
    ) -> Result<Session, ErrorCode> {
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions.get(&endpoint_id) {
            if existing.user != user {
                return Err(ErrorCode::Forbidden);
            }
            if !existing.is_stale(self.config.session_stale_after) {
                return Err(ErrorCode::Duplicate);
            }
            existing.kick.notify_one();
            self.stats.write().sessions_replaced += 1;
            info!("Replacing unresponsive session for {}", endpoint_id);
        } else if sessions.len() >= self.config.max_connections {
            return Err(ErrorCode::ServerFull);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let last_seen = Arc::new(Mutex::new(Instant::now()));
        let kick = Arc::new(Notify::new());
        sessions.insert(
            endpoint_id,
            SessionEntry {
                generation,
                user: user.clone(),
                name,
                outbound: outbound.clone(),
                last_seen: Arc::clone(&last_seen),
                kick: Arc::clone(&kick),
            },
        );

        Ok(Session {
            endpoint_id,
            generation,
            user,
            outbound,
            last_seen,
            kick,
        })
    }

    /// Remove the session only if it is still the one this connection registered
    fn remove(&self, endpoint_id: &EndpointId, generation: u64) -> bool {
        let mut sessions = self.sessions.lock();
        let owned = sessions
            .get(endpoint_id)
            .map_or(false, |entry| entry.generation == generation);
        if owned {
            sessions.remove(endpoint_id);
        }
        owned
    }

    fn route(&self, sender_user: &UserId, envelope: &SignalingEnvelope) -> Route {
        let sessions = self.sessions.lock();
        match sessions.get(&envelope.recipient_id) {
            None => Route::Bounce(ErrorCode::PeerUnreachable),
            Some(entry) if &entry.user != sender_user => Route::Bounce(ErrorCode::Forbidden),
            Some(entry) => Route::Deliver(entry.outbound.clone()),
        }
    }

    /// Deliver an envelope or bounce it back to the sender. Never retried.
    /// Delivery never waits on the recipient; a full queue bounces with
    /// `RecipientBusy`.
    async fn forward(&self, session: &Session, envelope: SignalingEnvelope) {
        let code = match self.route(&session.user, &envelope) {
            Route::Deliver(outbound) => {
                let recipient = envelope.recipient_id;
                let kind = envelope.kind;
                match outbound.try_send(RelayFrame::Envelope(envelope.clone())) {
                    Ok(()) => {
                        self.stats.write().envelopes_forwarded += 1;
                        debug!(
                            "Forwarded {:?} {} -> {}",
                            kind,
                            session.endpoint_id.short(),
                            recipient.short()
                        );
                        return;
                    }
                    Err(TrySendError::Full(_)) => ErrorCode::RecipientBusy,
                    // Recipient disconnected between lookup and send
                    Err(TrySendError::Closed(_)) => ErrorCode::PeerUnreachable,
                }
            }
            Route::Bounce(code) => code,
        };

        self.stats.write().forwards_failed += 1;
        debug!(
            "Cannot forward {:?} from {} to {}: {}",
            envelope.kind, envelope.sender_id, envelope.recipient_id, code
        );
        let message = format!("{}: {}", code, envelope.recipient_id);
        let bounce = SignalingEnvelope::bounce(&envelope, code, message);
        let _ = session.outbound.send(RelayFrame::Envelope(bounce)).await;
    }

    /// Bind `addr` and serve until the returned handle is shut down
    pub async fn start(self: Arc<Self>, addr: &str) -> Result<RelayServerHandle, RelayServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RelayServerError::NetworkError(e.to_string()))?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(listener, shutdown_rx));
        info!("Relay server listening on {}", local_addr);
        Ok(RelayServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }

    /// Accept loop; runs until `shutdown` flips
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let mut connections: Vec<JoinHandle<()>> = Vec::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let server = Arc::clone(&self);
                        connections.retain(|task| !task.is_finished());
                        connections.push(tokio::spawn(async move {
                            server.handle_connection(stream, peer_addr).await;
                        }));
                    }
                    Err(e) => {
                        error!("Relay accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        for task in connections {
            task.abort();
        }
        self.sessions.lock().clear();
        info!("Relay server stopped");
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        let max = self.config.max_message_bytes;

        let register = match tokio::time::timeout(
            self.config.register_timeout,
            read_frame(&mut reader, max),
        )
        .await
        {
            Ok(Ok(bytes)) => match RelayFrame::from_bytes(&bytes) {
                Ok(RelayFrame::Envelope(env)) if env.kind == EnvelopeKind::Register => env,
                _ => {
                    warn!("Relay connection {} sent a non-REGISTER first frame", peer_addr);
                    return;
                }
            },
            Ok(Err(e)) => {
                debug!("Relay connection {} closed before registering: {}", peer_addr, e);
                return;
            }
            Err(_) => {
                debug!("Relay connection {} did not register in time", peer_addr);
                return;
            }
        };
        let endpoint_id = register.sender_id;

        let admitted = match self
            .authenticator
            .authenticate(register.credentials.as_deref())
            .await
        {
            Ok(user) => {
                let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_queue.max(1));
                // Queued before admission so the ack precedes any forwarded envelope
                let _ = outbound.try_send(RelayFrame::Registered { endpoint_id });
                let name = register.name.clone().unwrap_or_default();
                self.admit(endpoint_id, user, name, outbound)
                    .map(|session| (session, outbound_rx))
            }
            Err(e) => {
                debug!("Authentication failed for {}: {}", endpoint_id, e);
                Err(ErrorCode::AuthInvalid)
            }
        };

        let (session, outbound_rx) = match admitted {
            Ok(admitted) => admitted,
            Err(code) => {
                self.stats.write().registrations_rejected += 1;
                warn!(
                    "Rejected registration of {} from {}: {}",
                    endpoint_id, peer_addr, code
                );
                let rejection = SignalingEnvelope::rejection(endpoint_id, code, code.as_str());
                let _ = send_direct(&mut writer, &RelayFrame::Envelope(rejection), max).await;
                return;
            }
        };
        info!(
            "Registered endpoint {} ({}) from {} as {}",
            endpoint_id,
            register.name.as_deref().unwrap_or("unnamed"),
            peer_addr,
            session.user
        );

        let mut writer_task = tokio::spawn(run_writer(writer, outbound_rx, max));
        let mut writer_done = false;

        loop {
            tokio::select! {
                _ = session.kick.notified() => {
                    info!("Session {} replaced by a newer registration", endpoint_id);
                    break;
                }
                _ = &mut writer_task => {
                    debug!("Writer for {} stopped", endpoint_id);
                    writer_done = true;
                    break;
                }
                frame = read_frame(&mut reader, max) => {
                    let bytes = match frame {
                        Ok(bytes) => bytes,
                        Err(e) if e.is_eof() => break,
                        Err(FrameError::TooLarge { len, max }) => {
                            warn!("Closing {}: frame of {} bytes exceeds {}", endpoint_id, len, max);
                            break;
                        }
                        Err(e) => {
                            debug!("Read from {} failed: {}", endpoint_id, e);
                            break;
                        }
                    };
                    *session.last_seen.lock() = Instant::now();

                    match RelayFrame::from_bytes(&bytes) {
                        Ok(RelayFrame::Ping) => {
                            let _ = session.outbound.send(RelayFrame::Pong).await;
                        }
                        Ok(RelayFrame::Pong) => {}
                        Ok(RelayFrame::Envelope(env)) => {
                            if env.kind == EnvelopeKind::Register || env.sender_id != endpoint_id {
                                warn!("Protocol violation from {}: {:?} as {}", endpoint_id, env.kind, env.sender_id);
                                break;
                            }
                            self.forward(&session, env).await;
                        }
                        Ok(RelayFrame::Registered { .. }) => {
                            warn!("Protocol violation from {}: unexpected Registered", endpoint_id);
                            break;
                        }
                        Err(e) => {
                            warn!("Undecodable frame from {}: {}", endpoint_id, e);
                            break;
                        }
                    }
                }
            }
        }

        if self.remove(&endpoint_id, session.generation) {
            info!("Endpoint {} disconnected", endpoint_id);
        }
        drop(session);
        if !writer_done
            && tokio::time::timeout(Duration::from_secs(1), &mut writer_task)
                .await
                .is_err()
        {
            writer_task.abort();
        }
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a relay server started with [`RelayServer::start`]
pub struct RelayServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drop all sessions and wait for the accept loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<RelayFrame>,
    max: usize,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = send_direct(&mut writer, &frame, max).await {
            debug!("Relay write failed: {}", e);
            break;
        }
    }
}

async fn send_direct(
    writer: &mut OwnedWriteHalf,
    frame: &RelayFrame,
    max: usize,
) -> Result<(), FrameError> {
    let bytes = frame
        .to_bytes()
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    write_frame(writer, &bytes, max).await
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server(config: RelayServerConfig) -> RelayServer {
        RelayServer::with_config(config)
    }

    fn queue() -> (mpsc::Sender<RelayFrame>, mpsc::Receiver<RelayFrame>) {
        mpsc::channel(8)
    }

    #[test]
    fn test_admit_and_remove() {
        let server = test_server(RelayServerConfig::default());
        let id = EndpointId::generate();
        let (tx, _rx) = queue();

        let session = server
            .admit(id, UserId::anonymous(), "a".into(), tx)
            .unwrap();
        assert!(server.is_registered(&id));
        assert_eq!(server.get_stats().sessions_active, 1);

        assert!(server.remove(&id, session.generation));
        assert!(!server.is_registered(&id));
        assert!(!server.remove(&id, session.generation));
    }

    #[test]
    fn test_live_duplicate_rejected() {
        let server = test_server(RelayServerConfig::default());
        let id = EndpointId::generate();
        let (tx1, _rx1) = queue();
        let (tx2, _rx2) = queue();

        server.admit(id, UserId::anonymous(), "a".into(), tx1).unwrap();
        let second = server.admit(id, UserId::anonymous(), "a".into(), tx2);
        assert!(matches!(second, Err(ErrorCode::Duplicate)));
    }

    #[test]
    fn test_stale_session_replaced() {
        let server = test_server(RelayServerConfig::default());
        let id = EndpointId::generate();
        let (tx1, rx1) = queue();
        let (tx2, _rx2) = queue();

        let old = server.admit(id, UserId::anonymous(), "a".into(), tx1).unwrap();
        // Old connection's writer is gone
        drop(rx1);
        let new = server.admit(id, UserId::anonymous(), "a".into(), tx2).unwrap();
        assert_ne!(old.generation, new.generation);
        assert_eq!(server.get_stats().sessions_replaced, 1);

        // Old teardown must not evict the replacement
        assert!(!server.remove(&id, old.generation));
        assert!(server.is_registered(&id));
    }

    #[test]
    fn test_silent_session_replaced() {
        let server = test_server(RelayServerConfig {
            session_stale_after: Duration::from_millis(0),
            ..Default::default()
        });
        let id = EndpointId::generate();
        let (tx1, _rx1) = queue();
        let (tx2, _rx2) = queue();

        server.admit(id, UserId::anonymous(), "a".into(), tx1).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(server.admit(id, UserId::anonymous(), "a".into(), tx2).is_ok());
    }

    #[test]
    fn test_other_user_forbidden_even_when_stale() {
        let server = test_server(RelayServerConfig::default());
        let id = EndpointId::generate();
        let (tx1, rx1) = queue();
        let (tx2, _rx2) = queue();

        server.admit(id, UserId::new("alice"), "a".into(), tx1).unwrap();
        drop(rx1);
        let result = server.admit(id, UserId::new("mallory"), "a".into(), tx2);
        assert!(matches!(result, Err(ErrorCode::Forbidden)));
    }

    #[test]
    fn test_server_full() {
        let server = test_server(RelayServerConfig {
            max_connections: 1,
            ..Default::default()
        });
        let (tx1, _rx1) = queue();
        let (tx2, _rx2) = queue();
        server
            .admit(EndpointId::generate(), UserId::anonymous(), "a".into(), tx1)
            .unwrap();
        let result = server.admit(EndpointId::generate(), UserId::anonymous(), "b".into(), tx2);
        assert!(matches!(result, Err(ErrorCode::ServerFull)));
    }

    #[tokio::test]
    async fn test_forward_to_unknown_bounces_payload() {
        let server = test_server(RelayServerConfig::default());
        let a = EndpointId::generate();
        let (tx, mut rx) = queue();
        let session = server.admit(a, UserId::anonymous(), "a".into(), tx).unwrap();

        let nobody = EndpointId::generate();
        let offer = SignalingEnvelope::new(EnvelopeKind::Offer, a, nobody, b"offer".to_vec());
        server.forward(&session, offer).await;

        match rx.recv().await {
            Some(RelayFrame::Envelope(env)) => {
                assert_eq!(env.kind, EnvelopeKind::Error);
                assert_eq!(env.error_code(), Some(ErrorCode::PeerUnreachable));
                assert_eq!(env.recipient_id, a);
                assert_eq!(env.sender_id, nobody);
                assert_eq!(env.payload, b"offer");
            }
            other => panic!("expected bounce, got {:?}", other),
        }
        assert_eq!(server.get_stats().forwards_failed, 1);
    }

    #[tokio::test]
    async fn test_forward_preserves_sender_order() {
        let server = test_server(RelayServerConfig::default());
        let a = EndpointId::generate();
        let b = EndpointId::generate();
        let (tx_a, _rx_a) = queue();
        let (tx_b, mut rx_b) = queue();
        let session_a = server.admit(a, UserId::anonymous(), "a".into(), tx_a).unwrap();
        server.admit(b, UserId::anonymous(), "b".into(), tx_b).unwrap();

        for i in 0..5u8 {
            let env = SignalingEnvelope::new(EnvelopeKind::Candidate, a, b, vec![i]);
            server.forward(&session_a, env).await;
        }
        for i in 0..5u8 {
            match rx_b.recv().await {
                Some(RelayFrame::Envelope(env)) => assert_eq!(env.payload, vec![i]),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(server.get_stats().envelopes_forwarded, 5);
    }

    #[tokio::test]
    async fn test_forward_across_users_forbidden() {
        let server = test_server(RelayServerConfig::default());
        let a = EndpointId::generate();
        let b = EndpointId::generate();
        let (tx_a, mut rx_a) = queue();
        let (tx_b, mut rx_b) = queue();
        let session_a = server.admit(a, UserId::new("alice"), "a".into(), tx_a).unwrap();
        server.admit(b, UserId::new("bob"), "b".into(), tx_b).unwrap();

        let env = SignalingEnvelope::new(EnvelopeKind::Offer, a, b, vec![1]);
        server.forward(&session_a, env).await;

        match rx_a.recv().await {
            Some(RelayFrame::Envelope(env)) => {
                assert_eq!(env.error_code(), Some(ErrorCode::Forbidden))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_recipient_queue_bounces_busy() {
        let server = test_server(RelayServerConfig::default());
        let a = EndpointId::generate();
        let b = EndpointId::generate();
        let (tx_a, mut rx_a) = queue();
        let (tx_b, _rx_b) = mpsc::channel(1);
        let session_a = server.admit(a, UserId::anonymous(), "a".into(), tx_a).unwrap();
        server.admit(b, UserId::anonymous(), "b".into(), tx_b).unwrap();

        for i in 0..3u8 {
            let env = SignalingEnvelope::new(EnvelopeKind::Candidate, a, b, vec![i]);
            // Must return promptly even though b never drains its queue
            tokio::time::timeout(Duration::from_secs(1), server.forward(&session_a, env))
                .await
                .expect("forward blocked on a full recipient queue");
        }

        let stats = server.get_stats();
        assert_eq!(stats.envelopes_forwarded, 1);
        assert_eq!(stats.forwards_failed, 2);
        for expected in [1u8, 2] {
            match rx_a.recv().await {
                Some(RelayFrame::Envelope(env)) => {
                    assert_eq!(env.error_code(), Some(ErrorCode::RecipientBusy));
                    assert_eq!(env.payload, vec![expected]);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
