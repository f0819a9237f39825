//! Peer Manager — negotiates, caches and reaps direct channels to peer endpoints
//!
//! The peer table holds at most one entry per peer: either a negotiation in
//! flight, which later callers join, or the connected channel this endpoint
//! dialed. Channels accepted from peers serve their requests but are not
//! used for outbound traffic, so simultaneous dials from both sides simply
//! leave each side with its own channel.

use super::channel::{ChannelLimits, Direction, PeerChannel, RequestHandler};
use super::negotiation::{
    announced_limit, decode_payload, dial_candidate, encode_payload, gather_candidates,
    recv_peer_frame, send_peer_frame, session_of, AnswerPayload, CandidatePayload,
    InitiatorState, OfferPayload, ResponderState, HELLO_MAX_FRAME,
};
use super::PeerError;
use crate::backoff::Backoff;
use crate::identity::EndpointId;
use crate::message::PeerFrame;
use crate::relay::{EnvelopeKind, ErrorCode, RelayClient, SignalingEnvelope};
use crate::store::MAX_OBJECT_SIZE_DEFAULT;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Peer manager configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Where the peer listener binds
    pub listen_address: SocketAddr,
    /// Extra addresses peers should try, e.g. a port-forwarded public address
    pub advertised_addresses: Vec<SocketAddr>,
    /// Budget for one OFFER -> connected attempt
    pub negotiation_timeout: Duration,
    /// Extra attempts after a failed negotiation
    pub max_negotiation_retries: u32,
    pub negotiation_backoff: Backoff,
    /// Channels with no traffic and no pending requests for this long are closed
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    /// Time allowed for the hello exchange on a fresh connection
    pub hello_timeout: Duration,
    pub max_object_size: usize,
    pub channel_queue: usize,
    /// Inbound requests executing at once, across all channels
    pub max_concurrent_requests: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertised_addresses: Vec::new(),
            negotiation_timeout: Duration::from_secs(10),
            max_negotiation_retries: 2,
            negotiation_backoff: Backoff::new(Duration::from_millis(200), Duration::from_secs(2), 0.25),
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            hello_timeout: Duration::from_secs(5),
            max_object_size: MAX_OBJECT_SIZE_DEFAULT,
            channel_queue: 128,
            max_concurrent_requests: 64,
        }
    }
}

/// Statistics about peer manager operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerManagerStats {
    pub negotiations_started: u64,
    pub negotiations_failed: u64,
    pub channels_opened: u64,
    pub channels_accepted: u64,
    pub channels_closed_idle: u64,
    pub active_channels: usize,
}

/// Observable state of a peer in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Negotiating(InitiatorState),
    Connected,
}

type NegotiationResult = Option<Result<Arc<PeerChannel>, PeerError>>;

enum PeerSlot {
    Connecting {
        state: InitiatorState,
        result: watch::Receiver<NegotiationResult>,
    },
    Connected(Arc<PeerChannel>),
}

/// Signaling relevant to an in-flight initiator negotiation
#[derive(Debug)]
enum Signal {
    Answer(Vec<SocketAddr>),
    Candidate(SocketAddr),
    Bounced(ErrorCode),
}

/// Initiator negotiations waiting on signaling: session_id -> (peer, signal queue)
#[derive(Default)]
struct OfferTable {
    offers: Mutex<HashMap<Uuid, (EndpointId, mpsc::UnboundedSender<Signal>)>>,
}

impl OfferTable {
    fn open(&self, session_id: Uuid, peer_id: EndpointId) -> mpsc::UnboundedReceiver<Signal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.offers.lock().insert(session_id, (peer_id, tx));
        rx
    }

    fn close(&self, session_id: &Uuid) {
        self.offers.lock().remove(session_id);
    }

    fn clear(&self) {
        self.offers.lock().clear();
    }

    /// Deliver `signal` to the negotiation for `session_id` if `from` is the
    /// peer it negotiates with. Returns whether it was delivered.
    fn deliver(&self, session_id: Uuid, from: EndpointId, signal: Signal) -> bool {
        let offers = self.offers.lock();
        match offers.get(&session_id) {
            Some((peer_id, tx)) if *peer_id == from => tx.send(signal).is_ok(),
            Some((peer_id, _)) => {
                warn!(
                    "Dropping {:?} for session {} from {}: negotiating with {}",
                    signal, session_id, from, peer_id
                );
                false
            }
            None => {
                debug!("No negotiation waiting on session {}", session_id);
                false
            }
        }
    }
}

/// A session this endpoint answered and expects a hello for
struct ExpectedSession {
    peer_id: EndpointId,
    state: ResponderState,
    expires: Instant,
}

struct Inner {
    local_id: EndpointId,
    config: PeerConfig,
    local_addr: SocketAddr,
    candidates: Vec<SocketAddr>,
    relay: Arc<RelayClient>,
    handler: Arc<dyn RequestHandler>,
    peers: Mutex<HashMap<EndpointId, PeerSlot>>,
    /// Every open channel, dialed or accepted: channel_id -> channel
    channels: Mutex<HashMap<u64, Arc<PeerChannel>>>,
    offers: OfferTable,
    expected: Mutex<HashMap<Uuid, ExpectedSession>>,
    next_channel_id: AtomicU64,
    /// Shared by every channel to bound inbound request execution
    inflight: Arc<Semaphore>,
    stats: RwLock<PeerManagerStats>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct PeerManager {
    inner: Arc<Inner>,
}

impl PeerManager {
    /// Bind the peer listener and start the signaling, accept and reaper tasks
    pub async fn start(
        local_id: EndpointId,
        config: PeerConfig,
        relay: Arc<RelayClient>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, PeerError> {
        let inbound = relay
            .take_inbound()
            .ok_or_else(|| PeerError::Protocol("relay inbound stream already taken".to_string()))?;
        let listener = TcpListener::bind(config.listen_address)
            .await
            .map_err(|e| PeerError::Io(format!("bind {}: {}", config.listen_address, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PeerError::Io(e.to_string()))?;
        let candidates = gather_candidates(local_addr, &config.advertised_addresses);
        info!("Peer listener on {} (candidates: {:?})", local_addr, candidates);
        let inflight = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));

        let inner = Arc::new(Inner {
            local_id,
            config,
            local_addr,
            candidates,
            relay,
            handler,
            peers: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            offers: OfferTable::default(),
            expected: Mutex::new(HashMap::new()),
            next_channel_id: AtomicU64::new(1),
            inflight,
            stats: RwLock::new(PeerManagerStats::default()),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let tasks = vec![
            tokio::spawn(Arc::clone(&inner).run_signaling(inbound)),
            tokio::spawn(Arc::clone(&inner).run_listener(listener)),
            tokio::spawn(Inner::run_reaper(Arc::downgrade(&inner))),
        ];
        inner.tasks.lock().extend(tasks);

        Ok(Self { inner })
    }

    pub fn local_id(&self) -> EndpointId {
        self.inner.local_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn candidates(&self) -> &[SocketAddr] {
        &self.inner.candidates
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn get_stats(&self) -> PeerManagerStats {
        let mut stats = self.inner.stats.read().clone();
        stats.active_channels = self.inner.channels.lock().len();
        stats
    }

    pub fn peer_state(&self, peer_id: &EndpointId) -> Option<PeerState> {
        match self.inner.peers.lock().get(peer_id) {
            Some(PeerSlot::Connecting { state, .. }) => Some(PeerState::Negotiating(*state)),
            Some(PeerSlot::Connected(channel)) if !channel.is_closed() => Some(PeerState::Connected),
            _ => None,
        }
    }

    /// A connected channel to `peer_id`, negotiating one if needed. Concurrent
    /// callers for the same peer share a single negotiation.
    pub async fn get_channel(
        &self,
        peer_id: EndpointId,
        timeout: Duration,
    ) -> Result<Arc<PeerChannel>, PeerError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(PeerError::ConnectionClosed);
        }
        if peer_id == inner.local_id {
            return Err(PeerError::NegotiationFailed("cannot open a channel to self".to_string()));
        }

        let mut result = {
            let mut peers = inner.peers.lock();
            let joined = match peers.get(&peer_id) {
                Some(PeerSlot::Connected(channel)) if !channel.is_closed() => {
                    return Ok(Arc::clone(channel));
                }
                Some(PeerSlot::Connecting { result, .. }) => Some(result.clone()),
                _ => None,
            };
            match joined {
                Some(rx) => rx,
                None => {
                    let (tx, rx) = watch::channel(None);
                    peers.insert(
                        peer_id,
                        PeerSlot::Connecting {
                            state: InitiatorState::New,
                            result: rx.clone(),
                        },
                    );
                    inner.stats.write().negotiations_started += 1;
                    let task = tokio::spawn(Arc::clone(inner).negotiate(peer_id, tx));
                    let mut tasks = inner.tasks.lock();
                    tasks.retain(|t| !t.is_finished());
                    tasks.push(task);
                    rx
                }
            }
        };

        let wait = async {
            loop {
                if let Some(outcome) = result.borrow_and_update().clone() {
                    return outcome;
                }
                if result.changed().await.is_err() {
                    return Err(PeerError::ConnectionClosed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| PeerError::Timeout)?
    }

    /// Close every channel and fail pending and future requests with `ConnectionClosed`
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks: Vec<_> = inner.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        let channels: Vec<_> = inner.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in &channels {
            channel.close();
        }
        inner.peers.lock().clear();
        inner.offers.clear();
        inner.expected.lock().clear();
        info!("Peer manager stopped ({} channels closed)", channels.len());
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            for task in self.inner.tasks.lock().drain(..) {
                task.abort();
            }
            for (_, channel) in self.inner.channels.lock().drain() {
                channel.close();
            }
        }
    }
}

impl Inner {
    fn set_initiator_state(&self, peer_id: EndpointId, next: InitiatorState) {
        if let Some(PeerSlot::Connecting { state, .. }) = self.peers.lock().get_mut(&peer_id) {
            debug!("Negotiation with {}: {:?} -> {:?}", peer_id.short(), state, next);
            *state = next;
        }
    }

    /// Negotiation task: retries with backoff, then publishes the outcome to all waiters
    async fn negotiate(
        self: Arc<Self>,
        peer_id: EndpointId,
        result: watch::Sender<NegotiationResult>,
    ) {
        let mut attempt: u32 = 0;
        let outcome = loop {
            match self.negotiate_once(peer_id).await {
                Ok((stream, peer_max_object)) => {
                    break Ok(self.open_channel(peer_id, Direction::Outbound, stream, peer_max_object))
                }
                // The relay is authoritative that the peer has no session
                Err(e @ PeerError::PeerUnreachable(_)) => break Err(e),
                Err(e) if attempt < self.config.max_negotiation_retries
                    && !self.closed.load(Ordering::Acquire) =>
                {
                    debug!("Negotiation with {} failed (attempt {}): {}", peer_id.short(), attempt + 1, e);
                    let delay = self.config.negotiation_backoff.delay(attempt);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        let outcome = {
            let mut peers = self.peers.lock();
            match outcome {
                Ok(channel) => {
                    peers.insert(peer_id, PeerSlot::Connected(Arc::clone(&channel)));
                    info!("Connected to peer {} (channel {})", peer_id, channel.channel_id());
                    Ok(channel)
                }
                Err(e) => {
                    if matches!(peers.get(&peer_id), Some(PeerSlot::Connecting { .. })) {
                        peers.remove(&peer_id);
                    }
                    self.stats.write().negotiations_failed += 1;
                    warn!("Negotiation with {} failed: {}", peer_id, e);
                    Err(e)
                }
            }
        };
        result.send_replace(Some(outcome));
    }

    /// One OFFER -> ANSWER -> dial attempt under a fresh session id
    async fn negotiate_once(&self, peer_id: EndpointId) -> Result<(TcpStream, usize), PeerError> {
        let session_id = Uuid::new_v4();
        let mut signals = self.offers.open(session_id, peer_id);
        let outcome = self.run_initiator(peer_id, session_id, &mut signals).await;
        self.offers.close(&session_id);
        let state = if outcome.is_ok() {
            InitiatorState::Connected
        } else {
            InitiatorState::Failed
        };
        self.set_initiator_state(peer_id, state);
        outcome
    }

    async fn run_initiator(
        &self,
        peer_id: EndpointId,
        session_id: Uuid,
        signals: &mut mpsc::UnboundedReceiver<Signal>,
    ) -> Result<(TcpStream, usize), PeerError> {
        let deadline = tokio::time::Instant::now() + self.config.negotiation_timeout;
        self.set_initiator_state(peer_id, InitiatorState::New);

        let offer = encode_payload(&OfferPayload {
            session_id,
            candidates: self.candidates.clone(),
        })?;
        self.relay
            .send(SignalingEnvelope::new(EnvelopeKind::Offer, self.local_id, peer_id, offer))
            .await
            .map_err(|e| PeerError::NegotiationFailed(format!("offer not sent: {}", e)))?;
        self.set_initiator_state(peer_id, InitiatorState::OfferSent);
        self.set_initiator_state(peer_id, InitiatorState::AwaitingAnswer);

        let mut candidates: VecDeque<SocketAddr> = VecDeque::new();
        let mut answered = false;
        loop {
            while let Ok(signal) = signals.try_recv() {
                apply_signal(peer_id, signal, &mut candidates, &mut answered)?;
            }

            if let Some(addr) = candidates.pop_front() {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let attempt_timeout = remaining.min(self.config.hello_timeout);
                match dial_candidate(
                    addr,
                    session_id,
                    self.local_id,
                    peer_id,
                    attempt_timeout,
                    self.config.max_object_size,
                )
                .await
                {
                    Ok(established) => return Ok(established),
                    Err(e) => {
                        debug!("Candidate {} for {} failed: {}", addr, peer_id.short(), e);
                        continue;
                    }
                }
            }

            match tokio::time::timeout_at(deadline, signals.recv()).await {
                Ok(Some(signal)) => apply_signal(peer_id, signal, &mut candidates, &mut answered)?,
                Ok(None) => return Err(PeerError::ConnectionClosed),
                Err(_) => break,
            }
        }

        Err(PeerError::NegotiationFailed(if answered {
            format!("no candidate of {} was reachable", peer_id)
        } else {
            format!("no answer from {}", peer_id)
        }))
    }

    fn open_channel(
        self: &Arc<Self>,
        peer_id: EndpointId,
        direction: Direction,
        stream: TcpStream,
        peer_max_object: usize,
    ) -> Arc<PeerChannel> {
        let channel_id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let limits = ChannelLimits::new(
            self.config.max_object_size,
            peer_max_object,
            self.config.channel_queue,
            Arc::clone(&self.inflight),
        );
        let channel = PeerChannel::spawn(
            channel_id,
            peer_id,
            direction,
            stream,
            Arc::clone(&self.handler),
            limits,
        );
        if peer_max_object < self.config.max_object_size {
            debug!(
                "Peer {} accepts objects up to {} bytes (local limit {})",
                peer_id.short(),
                peer_max_object,
                self.config.max_object_size
            );
        }
        self.channels.lock().insert(channel_id, Arc::clone(&channel));
        {
            let mut stats = self.stats.write();
            match direction {
                Direction::Outbound => stats.channels_opened += 1,
                Direction::Inbound => stats.channels_accepted += 1,
            }
        }

        let mut closed = channel.closed_signal();
        let watched = Arc::downgrade(&channel);
        let owner = Arc::downgrade(self);
        tokio::spawn(async move {
            let _ = closed.wait_for(|c| *c).await;
            if let (Some(inner), Some(channel)) = (owner.upgrade(), watched.upgrade()) {
                inner.forget_channel(&channel);
            }
        });
        channel
    }

    fn forget_channel(&self, channel: &PeerChannel) {
        self.channels.lock().remove(&channel.channel_id());
        let mut peers = self.peers.lock();
        let installed = matches!(
            peers.get(&channel.peer_id()),
            Some(PeerSlot::Connected(current)) if current.channel_id() == channel.channel_id()
        );
        if installed {
            peers.remove(&channel.peer_id());
        }
        debug!("Channel {} to {} closed", channel.channel_id(), channel.peer_id().short());
    }

    // ------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------

    async fn run_signaling(self: Arc<Self>, mut inbound: mpsc::Receiver<SignalingEnvelope>) {
        while let Some(envelope) = inbound.recv().await {
            if envelope.recipient_id != self.local_id {
                debug!("Ignoring envelope addressed to {}", envelope.recipient_id);
                continue;
            }
            match envelope.kind {
                EnvelopeKind::Offer => self.handle_offer(envelope).await,
                EnvelopeKind::Answer => self.route_answer(&envelope),
                EnvelopeKind::Candidate => self.route_candidate(&envelope),
                EnvelopeKind::Error => self.route_bounce(&envelope),
                EnvelopeKind::Register => {}
            }
        }
        debug!("Relay inbound stream ended");
    }

    /// Responder: remember the session, answer, then trickle advertised addresses
    async fn handle_offer(&self, envelope: SignalingEnvelope) {
        let peer_id = envelope.sender_id;
        let offer: OfferPayload = match decode_payload(&envelope.payload) {
            Ok(offer) => offer,
            Err(e) => {
                warn!("Malformed offer from {}: {}", peer_id, e);
                return;
            }
        };
        debug!(
            "Offer {} from {} ({} candidates)",
            offer.session_id,
            peer_id.short(),
            offer.candidates.len()
        );

        let now = Instant::now();
        {
            let mut expected = self.expected.lock();
            expected.retain(|_, session| session.expires > now);
            expected.insert(
                offer.session_id,
                ExpectedSession {
                    peer_id,
                    state: ResponderState::OfferReceived,
                    expires: now + self.config.negotiation_timeout,
                },
            );
        }
        let mut state = ResponderState::OfferReceived;

        let (direct, trickled): (Vec<SocketAddr>, Vec<SocketAddr>) = self
            .candidates
            .iter()
            .partition(|addr| !self.config.advertised_addresses.contains(addr));
        let answer = AnswerPayload {
            session_id: offer.session_id,
            candidates: direct,
        };
        let payload = match encode_payload(&answer) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not encode answer for {}: {}", peer_id, e);
                self.expected.lock().remove(&offer.session_id);
                return;
            }
        };
        // The initiator may dial as soon as the answer leaves, so accept hellos from now on
        if let Some(session) = self.expected.lock().get_mut(&offer.session_id) {
            session.state = ResponderState::AnswerSent;
            state = session.state;
        }
        let envelope = SignalingEnvelope::new(EnvelopeKind::Answer, self.local_id, peer_id, payload);
        if let Err(e) = self.relay.send(envelope).await {
            warn!("Could not answer {} ({:?} -> {:?}): {}", peer_id, state, ResponderState::Failed, e);
            self.expected.lock().remove(&offer.session_id);
            return;
        }

        for candidate in trickled {
            let payload = match encode_payload(&CandidatePayload {
                session_id: offer.session_id,
                candidate,
            }) {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            let envelope = SignalingEnvelope::new(EnvelopeKind::Candidate, self.local_id, peer_id, payload);
            if self.relay.send(envelope).await.is_err() {
                break;
            }
        }
    }

    fn route_answer(&self, envelope: &SignalingEnvelope) {
        match decode_payload::<AnswerPayload>(&envelope.payload) {
            Ok(answer) => {
                self.offers
                    .deliver(answer.session_id, envelope.sender_id, Signal::Answer(answer.candidates));
            }
            Err(e) => warn!("Malformed answer from {}: {}", envelope.sender_id, e),
        }
    }

    fn route_candidate(&self, envelope: &SignalingEnvelope) {
        match decode_payload::<CandidatePayload>(&envelope.payload) {
            Ok(c) => {
                self.offers
                    .deliver(c.session_id, envelope.sender_id, Signal::Candidate(c.candidate));
            }
            Err(e) => warn!("Malformed candidate from {}: {}", envelope.sender_id, e),
        }
    }

    /// The relay echoes the undelivered payload, which names the session.
    /// A bounce carries the original recipient as its sender.
    fn route_bounce(&self, envelope: &SignalingEnvelope) {
        let code = envelope.error_code().unwrap_or(ErrorCode::PeerUnreachable);
        match session_of(&envelope.payload) {
            Some(session_id) => {
                self.offers
                    .deliver(session_id, envelope.sender_id, Signal::Bounced(code));
            }
            None => debug!("Relay error without session: {}", code),
        }
    }

    // ------------------------------------------------------------------
    // Accepting channels
    // ------------------------------------------------------------------

    async fn run_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let inner = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = inner.accept_channel(stream).await {
                            debug!("Rejected connection from {}: {}", remote, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Peer accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn accept_channel(self: Arc<Self>, mut stream: TcpStream) -> Result<(), PeerError> {
        let max_frame = HELLO_MAX_FRAME;
        let (session_id, endpoint_id, peer_max_object) =
            match recv_peer_frame(&mut stream, max_frame, self.config.hello_timeout).await? {
                PeerFrame::Hello {
                    session_id,
                    endpoint_id,
                    max_object_size,
                } => (session_id, endpoint_id, announced_limit(max_object_size)),
                other => {
                    return Err(PeerError::Protocol(format!(
                        "expected Hello, got {}",
                        other.frame_type()
                    )))
                }
            };

        let session = self.expected.lock().remove(&session_id);
        let reject = match session {
            None => Some("unknown session"),
            Some(s) if s.peer_id != endpoint_id => Some("session belongs to another endpoint"),
            Some(s) if s.state != ResponderState::AnswerSent => Some("session not answered"),
            Some(s) if s.expires <= Instant::now() => Some("session expired"),
            Some(_) => None,
        };
        if let Some(reason) = reject {
            let frame = PeerFrame::HelloReject {
                reason: reason.to_string(),
            };
            let _ = send_peer_frame(&mut stream, &frame, max_frame).await;
            return Err(PeerError::NegotiationFailed(reason.to_string()));
        }

        let ack = PeerFrame::HelloAck {
            endpoint_id: self.local_id,
            max_object_size: self.config.max_object_size as u64,
        };
        send_peer_frame(&mut stream, &ack, max_frame).await?;
        if self.closed.load(Ordering::Acquire) {
            return Err(PeerError::ConnectionClosed);
        }
        let channel = self.open_channel(endpoint_id, Direction::Inbound, stream, peer_max_object);
        info!(
            "Accepted channel {} from peer {} ({:?})",
            channel.channel_id(),
            endpoint_id,
            ResponderState::Connected
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Idle reaping
    // ------------------------------------------------------------------

    async fn run_reaper(inner: Weak<Self>) {
        let interval = match inner.upgrade() {
            Some(inner) => inner.config.reap_interval,
            None => return,
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match inner.upgrade() {
                Some(inner) => inner.reap_idle(),
                None => return,
            }
        }
    }

    fn reap_idle(&self) {
        let idle: Vec<Arc<PeerChannel>> = self
            .channels
            .lock()
            .values()
            .filter(|c| c.pending_count() == 0 && c.idle_for() >= self.config.idle_timeout)
            .cloned()
            .collect();
        for channel in idle {
            info!(
                "Closing idle channel {} to {} after {:?}",
                channel.channel_id(),
                channel.peer_id(),
                channel.idle_for()
            );
            self.stats.write().channels_closed_idle += 1;
            channel.close();
            self.forget_channel(&channel);
        }
        self.expected.lock().retain(|_, s| s.expires > Instant::now());
    }
}

fn apply_signal(
    peer_id: EndpointId,
    signal: Signal,
    candidates: &mut VecDeque<SocketAddr>,
    answered: &mut bool,
) -> Result<(), PeerError> {
    match signal {
        Signal::Answer(addrs) => {
            *answered = true;
            // Answer candidates go ahead of any trickled ones
            for addr in addrs.into_iter().rev() {
                candidates.push_front(addr);
            }
            Ok(())
        }
        Signal::Candidate(addr) => {
            candidates.push_back(addr);
            Ok(())
        }
        Signal::Bounced(ErrorCode::PeerUnreachable) => Err(PeerError::PeerUnreachable(peer_id)),
        Signal::Bounced(code) => Err(PeerError::NegotiationFailed(format!(
            "relay refused signaling to {}: {}",
            peer_id, code
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_signals_only_from_negotiated_peer() {
        let table = OfferTable::default();
        let session_id = Uuid::new_v4();
        let peer = EndpointId::generate();
        let intruder = EndpointId::generate();
        let mut signals = table.open(session_id, peer);

        let forged: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        assert!(!table.deliver(session_id, intruder, Signal::Candidate(forged)));
        assert!(!table.deliver(session_id, intruder, Signal::Bounced(ErrorCode::PeerUnreachable)));
        assert!(signals.try_recv().is_err());

        let real: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert!(table.deliver(session_id, peer, Signal::Answer(vec![real])));
        match signals.try_recv() {
            Ok(Signal::Answer(addrs)) => assert_eq!(addrs, vec![real]),
            other => panic!("expected answer, got {:?}", other),
        }
    }

    #[test]
    fn test_closed_offer_drops_signals() {
        let table = OfferTable::default();
        let session_id = Uuid::new_v4();
        let peer = EndpointId::generate();
        let _signals = table.open(session_id, peer);
        table.close(&session_id);
        let addr: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        assert!(!table.deliver(session_id, peer, Signal::Candidate(addr)));
    }

    #[test]
    fn test_bounce_maps_to_peer_error() {
        let peer = EndpointId::generate();
        let mut candidates = VecDeque::new();
        let mut answered = false;
        assert_eq!(
            apply_signal(peer, Signal::Bounced(ErrorCode::PeerUnreachable), &mut candidates, &mut answered),
            Err(PeerError::PeerUnreachable(peer))
        );
        assert!(matches!(
            apply_signal(peer, Signal::Bounced(ErrorCode::RecipientBusy), &mut candidates, &mut answered),
            Err(PeerError::NegotiationFailed(_))
        ));
    }
}
