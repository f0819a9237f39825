//! Relay Client — keeps one registered signaling connection to the relay
//!
//! A supervisor task cycles DISCONNECTED -> CONNECTING -> CONNECTED and back,
//! sleeping with capped, jittered exponential backoff between attempts. The
//! state only becomes CONNECTED after the relay acknowledged REGISTER.

use super::protocol::{EnvelopeKind, ErrorCode, RelayFrame, SignalingEnvelope, DEFAULT_MAX_MESSAGE_BYTES};
use crate::backoff::Backoff;
use crate::identity::EndpointId;
use crate::message::{read_frame, write_frame, FrameError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Relay address (`host:port`, optional `tcp://` prefix)
    pub relay_address: String,
    /// Sent with REGISTER when set
    pub credentials: Option<String>,
    /// Reconnection backoff (1s doubling to 60s, 25% jitter by default)
    pub backoff: Backoff,
    pub connect_timeout: Duration,
    /// How long to wait for the relay to acknowledge REGISTER
    pub register_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_message_bytes: usize,
    pub outbound_queue: usize,
    pub inbound_queue: usize,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            relay_address: "127.0.0.1:8700".to_string(),
            credentials: None,
            backoff: Backoff::default(),
            connect_timeout: Duration::from_secs(10),
            register_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            outbound_queue: 256,
            inbound_queue: 256,
        }
    }
}

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Dialing and registering
    Connecting,
    /// Registered and usable
    Connected,
    /// Relay refused registration for good; no more attempts
    Rejected(ErrorCode),
    /// Closed locally
    Closed,
}

/// Relay client error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayClientError {
    #[error("Not connected to relay")]
    NotConnected,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Registration rejected: {0}")]
    Rejected(ErrorCode),
    #[error("Timed out waiting for relay")]
    Timeout,
    #[error("Relay client closed")]
    Closed,
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<FrameError> for RelayClientError {
    fn from(e: FrameError) -> Self {
        RelayClientError::ConnectionFailed(e.to_string())
    }
}

/// Rejections that no amount of retrying will fix
fn is_terminal(code: ErrorCode) -> bool {
    matches!(code, ErrorCode::AuthInvalid | ErrorCode::Forbidden)
}

/// Relay client for one endpoint
pub struct RelayClient {
    endpoint_id: EndpointId,
    state: watch::Receiver<ConnectionState>,
    /// Outbound queue of the current connection, if any
    outbound: Arc<Mutex<Option<mpsc::Sender<RelayFrame>>>>,
    inbound: Mutex<Option<mpsc::Receiver<SignalingEnvelope>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayClient {
    /// Spawn the connection supervisor and return immediately
    pub fn start(endpoint_id: EndpointId, name: String, config: RelayClientConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let outbound = Arc::new(Mutex::new(None));

        let supervisor = Supervisor {
            endpoint_id,
            name,
            config,
            state: state_tx,
            outbound: Arc::clone(&outbound),
            inbound: inbound_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            endpoint_id,
            state: state_rx,
            outbound,
            inbound: Mutex::new(Some(inbound_rx)),
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Envelopes addressed to this endpoint; can be taken once
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<SignalingEnvelope>> {
        self.inbound.lock().take()
    }

    /// Queue an envelope for the relay. Fails fast when not connected.
    pub async fn send(&self, envelope: SignalingEnvelope) -> Result<(), RelayClientError> {
        if envelope.kind == EnvelopeKind::Register {
            return Err(RelayClientError::Protocol(
                "REGISTER is sent by the client itself".to_string(),
            ));
        }
        if !self.is_connected() {
            return Err(RelayClientError::NotConnected);
        }
        let outbound = self
            .outbound
            .lock()
            .clone()
            .ok_or(RelayClientError::NotConnected)?;
        outbound
            .send(RelayFrame::Envelope(envelope))
            .await
            .map_err(|_| RelayClientError::NotConnected)
    }

    /// Wait until registered, rejected, closed or `timeout` elapses
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), RelayClientError> {
        let mut state = self.state.clone();
        let wait = async {
            loop {
                match *state.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Rejected(code) => return Err(RelayClientError::Rejected(code)),
                    ConnectionState::Closed => return Err(RelayClientError::Closed),
                    _ => {}
                }
                if state.changed().await.is_err() {
                    return Err(RelayClientError::Closed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RelayClientError::Timeout)?
    }

    /// Stop reconnecting and drop the relay connection
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

struct Supervisor {
    endpoint_id: EndpointId,
    name: String,
    config: RelayClientConfig,
    state: watch::Sender<ConnectionState>,
    outbound: Arc<Mutex<Option<mpsc::Sender<RelayFrame>>>>,
    inbound: mpsc::Sender<SignalingEnvelope>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.state.send_replace(ConnectionState::Connecting);

            match self.connect_and_register().await {
                Ok((reader, writer)) => {
                    attempt = 0;
                    info!("Registered with relay {} as {}", self.config.relay_address, self.endpoint_id);
                    let reason = self.run_session(reader, writer).await;
                    *self.outbound.lock() = None;
                    self.state.send_replace(ConnectionState::Disconnected);
                    if *self.shutdown.borrow() {
                        break;
                    }
                    warn!("Relay connection lost: {}", reason);
                }
                Err(RelayClientError::Rejected(code)) if is_terminal(code) => {
                    warn!("Relay rejected registration of {}: {}", self.endpoint_id, code);
                    self.state.send_replace(ConnectionState::Rejected(code));
                    return;
                }
                Err(e) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    debug!("Relay connect attempt {} failed: {}", attempt + 1, e);
                }
            }

            let delay = self.config.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        *self.outbound.lock() = None;
        self.state.send_replace(ConnectionState::Closed);
    }

    async fn connect_and_register(
        &self,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf), RelayClientError> {
        let address = self
            .config
            .relay_address
            .strip_prefix("tcp://")
            .unwrap_or(&self.config.relay_address);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| RelayClientError::Timeout)?
            .map_err(|e| RelayClientError::ConnectionFailed(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let register = RelayFrame::Envelope(SignalingEnvelope::register(
            self.endpoint_id,
            self.name.clone(),
            self.config.credentials.clone(),
        ));
        send_frame(&mut writer, &register, self.config.max_message_bytes).await?;

        let reply = tokio::time::timeout(
            self.config.register_timeout,
            read_frame(&mut reader, self.config.max_message_bytes),
        )
        .await
        .map_err(|_| RelayClientError::Timeout)??;

        match RelayFrame::from_bytes(&reply) {
            Ok(RelayFrame::Registered { endpoint_id }) if endpoint_id == self.endpoint_id => {
                Ok((reader, writer))
            }
            Ok(RelayFrame::Envelope(env)) if env.kind == EnvelopeKind::Error => {
                let code = env.error_code().unwrap_or(ErrorCode::AuthInvalid);
                Err(RelayClientError::Rejected(code))
            }
            Ok(other) => Err(RelayClientError::Protocol(format!(
                "unexpected reply to REGISTER: {}",
                other.frame_type()
            ))),
            Err(e) => Err(RelayClientError::Protocol(e.to_string())),
        }
    }

    /// Pump frames until the connection fails or shutdown; returns why it ended
    async fn run_session(&mut self, mut reader: OwnedReadHalf, writer: OwnedWriteHalf) -> String {
        let max = self.config.max_message_bytes;
        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_queue.max(1));
        *self.outbound.lock() = Some(out_tx.clone());
        self.state.send_replace(ConnectionState::Connected);

        let writer_task = tokio::spawn(run_writer(writer, out_rx, max));
        let heartbeat_task = tokio::spawn(run_heartbeat(out_tx.clone(), self.config.heartbeat_interval));
        // Three missed heartbeats means the relay is gone
        let silence_limit = self.config.heartbeat_interval.saturating_mul(3);

        let reason = loop {
            tokio::select! {
                _ = self.shutdown.changed() => break "closed locally".to_string(),
                frame = tokio::time::timeout(silence_limit, read_frame(&mut reader, max)) => {
                    let bytes = match frame {
                        Err(_) => break "relay stopped responding".to_string(),
                        Ok(Err(e)) if e.is_eof() => break "relay closed the connection".to_string(),
                        Ok(Err(e)) => break e.to_string(),
                        Ok(Ok(bytes)) => bytes,
                    };
                    match RelayFrame::from_bytes(&bytes) {
                        Ok(RelayFrame::Envelope(env)) => {
                            if self.inbound.send(env).await.is_err() {
                                debug!("Inbound envelope dropped: no consumer");
                            }
                        }
                        Ok(RelayFrame::Ping) => {
                            let _ = out_tx.send(RelayFrame::Pong).await;
                        }
                        Ok(RelayFrame::Pong) | Ok(RelayFrame::Registered { .. }) => {}
                        Err(e) => break format!("undecodable frame: {}", e),
                    }
                }
            }
        };

        heartbeat_task.abort();
        writer_task.abort();
        reason
    }
}

async fn run_writer(mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<RelayFrame>, max: usize) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = send_frame(&mut writer, &frame, max).await {
            debug!("Relay write failed: {}", e);
            break;
        }
    }
}

async fn run_heartbeat(outbound: mpsc::Sender<RelayFrame>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if outbound.send(RelayFrame::Ping).await.is_err() {
            break;
        }
    }
}

async fn send_frame(
    writer: &mut OwnedWriteHalf,
    frame: &RelayFrame,
    max: usize,
) -> Result<(), RelayClientError> {
    let bytes = frame
        .to_bytes()
        .map_err(|e| RelayClientError::Protocol(e.to_string()))?;
    write_frame(writer, &bytes, max).await?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::auth::TokenAuthenticator;
    use crate::relay::server::{RelayServer, RelayServerConfig};

    fn fast_config(relay_address: String) -> RelayClientConfig {
        RelayClientConfig {
            relay_address,
            backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(100), 0.1),
            connect_timeout: Duration::from_secs(1),
            register_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_disconnected() {
        // Bound then dropped, so nothing listens here
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = RelayClient::start(EndpointId::generate(), "lonely".into(), fast_config(addr));
        let env = SignalingEnvelope::new(
            EnvelopeKind::Offer,
            client.endpoint_id(),
            EndpointId::generate(),
            Vec::new(),
        );
        assert_eq!(client.send(env).await, Err(RelayClientError::NotConnected));
        assert_eq!(
            client.wait_connected(Duration::from_millis(150)).await,
            Err(RelayClientError::Timeout)
        );
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_registers_and_exchanges_envelopes() {
        let relay = Arc::new(RelayServer::new()).start("127.0.0.1:0").await.unwrap();
        let addr = relay.local_addr().to_string();

        let a = RelayClient::start(EndpointId::generate(), "a".into(), fast_config(addr.clone()));
        let b = RelayClient::start(EndpointId::generate(), "b".into(), fast_config(addr));
        a.wait_connected(Duration::from_secs(2)).await.unwrap();
        b.wait_connected(Duration::from_secs(2)).await.unwrap();

        let mut b_inbound = b.take_inbound().unwrap();
        assert!(b.take_inbound().is_none());

        let env = SignalingEnvelope::new(EnvelopeKind::Offer, a.endpoint_id(), b.endpoint_id(), b"hi".to_vec());
        a.send(env.clone()).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), b_inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, env);

        a.close().await;
        b.close().await;
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_auth_rejection_is_terminal() {
        let auth = Arc::new(TokenAuthenticator::new("secret", "relay"));
        let server = RelayServer::with_authenticator(RelayServerConfig::default(), auth);
        let relay = Arc::new(server).start("127.0.0.1:0").await.unwrap();

        let client = RelayClient::start(
            EndpointId::generate(),
            "nocreds".into(),
            fast_config(relay.local_addr().to_string()),
        );
        assert_eq!(
            client.wait_connected(Duration::from_secs(2)).await,
            Err(RelayClientError::Rejected(ErrorCode::AuthInvalid))
        );
        assert_eq!(client.state(), ConnectionState::Rejected(ErrorCode::AuthInvalid));
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_valid_token_accepted() {
        let auth = Arc::new(TokenAuthenticator::new("secret", "relay"));
        let token = auth.issue("alice", Duration::from_secs(60));
        let server = RelayServer::with_authenticator(RelayServerConfig::default(), auth);
        let relay = Arc::new(server).start("127.0.0.1:0").await.unwrap();

        let mut config = fast_config(relay.local_addr().to_string());
        config.credentials = Some(token);
        let client = RelayClient::start(EndpointId::generate(), "alice-ep".into(), config);
        client.wait_connected(Duration::from_secs(2)).await.unwrap();
        client.close().await;
        relay.shutdown().await;
    }
}
