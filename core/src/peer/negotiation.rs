//! Direct-channel negotiation over relay signaling
//!
//! The initiator sends OFFER carrying a fresh session id and its own
//! candidate addresses. The responder remembers the session, replies with
//! ANSWER listing the addresses it accepts on, and trickles any extra
//! advertised addresses as CANDIDATE envelopes. The initiator dials the
//! candidates in order and opens the channel with `Hello{session_id}`; the
//! channel counts as connected only after the responder's `HelloAck`.

use super::PeerError;
use crate::identity::EndpointId;
use crate::message::{decode_peer_frame, encode_peer_frame, read_frame, write_frame, PeerFrame};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::net::TcpStream;
use uuid::Uuid;

/// Initiator side of a negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    New,
    OfferSent,
    AwaitingAnswer,
    Connected,
    Failed,
}

/// Responder side of a negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    New,
    OfferReceived,
    AnswerSent,
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub session_id: Uuid,
    pub candidates: Vec<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub session_id: Uuid,
    pub candidates: Vec<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub session_id: Uuid,
    pub candidate: SocketAddr,
}

/// Session id common to every negotiation payload; used to route bounced envelopes
#[derive(Debug, Deserialize)]
struct SessionTag {
    session_id: Uuid,
}

pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, PeerError> {
    serde_json::to_vec(payload).map_err(|e| PeerError::Protocol(e.to_string()))
}

pub fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, PeerError> {
    serde_json::from_slice(bytes).map_err(|e| PeerError::Protocol(e.to_string()))
}

/// Session id of any OFFER/ANSWER/CANDIDATE payload
pub fn session_of(bytes: &[u8]) -> Option<Uuid> {
    serde_json::from_slice::<SessionTag>(bytes)
        .ok()
        .map(|tag| tag.session_id)
}

/// Addresses a peer may dial to reach a listener bound at `bound`.
///
/// Configured `advertised` addresses come first. A wildcard bind is
/// expanded to the primary outbound interface address and loopback.
pub fn gather_candidates(bound: SocketAddr, advertised: &[SocketAddr]) -> Vec<SocketAddr> {
    let mut candidates: Vec<SocketAddr> = advertised.to_vec();
    if bound.ip().is_unspecified() {
        if let Some(ip) = primary_interface_ip() {
            candidates.push(SocketAddr::new(ip, bound.port()));
        }
        candidates.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port()));
    } else {
        candidates.push(bound);
    }
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|addr| seen.insert(*addr));
    candidates
}

/// Source address the OS would use for outbound traffic. No packet is sent.
fn primary_interface_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

pub(crate) async fn send_peer_frame(
    stream: &mut TcpStream,
    frame: &PeerFrame,
    max_frame: usize,
) -> Result<(), PeerError> {
    let bytes = encode_peer_frame(frame).map_err(|e| PeerError::Protocol(e.to_string()))?;
    write_frame(stream, &bytes, max_frame)
        .await
        .map_err(|e| PeerError::Io(e.to_string()))
}

pub(crate) async fn recv_peer_frame(
    stream: &mut TcpStream,
    max_frame: usize,
    timeout: Duration,
) -> Result<PeerFrame, PeerError> {
    let bytes = tokio::time::timeout(timeout, read_frame(stream, max_frame))
        .await
        .map_err(|_| PeerError::Timeout)?
        .map_err(|e| PeerError::Io(e.to_string()))?;
    decode_peer_frame(&bytes).map_err(|e| PeerError::Protocol(e.to_string()))
}

/// Hello frames never carry object data
pub const HELLO_MAX_FRAME: usize = 4 * 1024;

/// Dial one candidate and complete the hello exchange as initiator.
/// Returns the stream and the largest object the peer accepts.
pub async fn dial_candidate(
    addr: SocketAddr,
    session_id: Uuid,
    local_id: EndpointId,
    expected_peer: EndpointId,
    timeout: Duration,
    max_object_size: usize,
) -> Result<(TcpStream, usize), PeerError> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::Timeout)?
        .map_err(|e| PeerError::Io(format!("connect {}: {}", addr, e)))?;

    let hello = PeerFrame::Hello {
        session_id,
        endpoint_id: local_id,
        max_object_size: max_object_size as u64,
    };
    send_peer_frame(&mut stream, &hello, HELLO_MAX_FRAME).await?;

    match recv_peer_frame(&mut stream, HELLO_MAX_FRAME, timeout).await? {
        PeerFrame::HelloAck {
            endpoint_id,
            max_object_size,
        } if endpoint_id == expected_peer => Ok((stream, announced_limit(max_object_size))),
        PeerFrame::HelloAck { endpoint_id, .. } => Err(PeerError::NegotiationFailed(format!(
            "{} answered as {} instead of {}",
            addr, endpoint_id, expected_peer
        ))),
        PeerFrame::HelloReject { reason } => Err(PeerError::NegotiationFailed(format!(
            "{} rejected hello: {}",
            addr, reason
        ))),
        other => Err(PeerError::Protocol(format!(
            "unexpected {} during hello",
            other.frame_type()
        ))),
    }
}

/// A peer's announced limit, saturated to what this platform can address
pub fn announced_limit(max_object_size: u64) -> usize {
    usize::try_from(max_object_size).unwrap_or(usize::MAX)
}
