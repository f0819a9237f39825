//! Direct peer channels
//!
//! Channels are negotiated through relay signaling, then carry request and
//! response envelopes over a framed TCP stream. At most one negotiation per
//! remote endpoint is in flight at any time.

pub mod channel;
pub mod manager;
pub mod negotiation;

pub use channel::{ChannelLimits, Direction, PeerChannel, RequestHandler};
pub use manager::{PeerConfig, PeerManager, PeerManagerStats, PeerState};
pub use negotiation::{InitiatorState, ResponderState};

use crate::identity::EndpointId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(EndpointId),
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("Timed out")]
    Timeout,
    #[error("Channel closed")]
    ConnectionClosed,
    #[error("Object of {size} bytes exceeds the peer limit of {max}")]
    TooLarge { size: usize, max: usize },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl PeerError {
    /// Whether a fresh attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, PeerError::Timeout | PeerError::ConnectionClosed)
    }
}
