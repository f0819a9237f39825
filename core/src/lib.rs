// PeerStore Core — Object Exchange Spine
//
// Every endpoint owns the objects it stores. Anyone holding a key can read
// it, but only through the owner, over a direct channel negotiated via the
// relay. The relay never sees object bytes.

pub mod backoff;
pub mod endpoint;
pub mod identity;
pub mod message;
pub mod peer;
pub mod relay;
pub mod router;
pub mod store;

use thiserror::Error;

pub use endpoint::{Endpoint, EndpointConfig, ObjectRef};
pub use identity::{EndpointId, EndpointIdentity, IdentityError, Key, ObjectId};
pub use message::{FrameError, Operation};
pub use peer::{PeerConfig, PeerError, PeerManager};
pub use relay::{
    RelayClient, RelayClientConfig, RelayClientError, RelayServer, RelayServerConfig,
    TokenAuthenticator,
};
pub use router::{Outcome, RequestRouter, RouterConfig};
pub use store::{ObjectStore, StoreError};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerStoreError {
    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(EndpointId),
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("Request timed out after {attempts} attempt(s)")]
    RequestTimeout { attempts: u32 },
    /// One wait on a peer expired outside the retry loop
    #[error("Timed out waiting for peer")]
    PeerTimeout,
    #[error("Object too large: {size} bytes (max {max})")]
    ObjectTooLarge { size: usize, max: usize },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("No relay configured; remote keys are unreachable")]
    PeeringUnavailable,
    #[error("Remote error: {0}")]
    RemoteError(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<StoreError> for PeerStoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::TooLarge { size, max } => PeerStoreError::ObjectTooLarge { size, max },
            StoreError::Backend(message) => PeerStoreError::Storage(message),
        }
    }
}

impl From<PeerError> for PeerStoreError {
    fn from(e: PeerError) -> Self {
        match e {
            PeerError::PeerUnreachable(peer) => PeerStoreError::PeerUnreachable(peer),
            PeerError::NegotiationFailed(reason) => PeerStoreError::NegotiationFailed(reason),
            PeerError::Timeout => PeerStoreError::PeerTimeout,
            PeerError::ConnectionClosed => PeerStoreError::ConnectionClosed,
            PeerError::TooLarge { size, max } => PeerStoreError::ObjectTooLarge { size, max },
            PeerError::Protocol(message) => PeerStoreError::Codec(message),
            PeerError::Io(message) => PeerStoreError::Io(message),
        }
    }
}

impl From<RelayClientError> for PeerStoreError {
    fn from(e: RelayClientError) -> Self {
        match e {
            RelayClientError::Rejected(code) => PeerStoreError::RegistrationRejected(code.to_string()),
            RelayClientError::Closed => PeerStoreError::ConnectionClosed,
            RelayClientError::Protocol(message) => PeerStoreError::Codec(message),
            other => PeerStoreError::Io(other.to_string()),
        }
    }
}

impl From<FrameError> for PeerStoreError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(io) => PeerStoreError::Io(io.to_string()),
            other => PeerStoreError::Codec(other.to_string()),
        }
    }
}

impl From<IdentityError> for PeerStoreError {
    fn from(e: IdentityError) -> Self {
        PeerStoreError::InvalidInput(e.to_string())
    }
}

impl PeerStoreError {
    /// Whether the caller may reasonably try again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PeerStoreError::RequestTimeout { .. }
                | PeerStoreError::PeerTimeout
                | PeerStoreError::ConnectionClosed
                | PeerStoreError::NegotiationFailed(_)
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::ErrorCode;

    #[test]
    fn test_store_errors_convert() {
        let err: PeerStoreError = StoreError::TooLarge { size: 9, max: 8 }.into();
        assert_eq!(err, PeerStoreError::ObjectTooLarge { size: 9, max: 8 });
        let err: PeerStoreError = StoreError::Backend("io".into()).into();
        assert!(matches!(err, PeerStoreError::Storage(_)));
    }

    #[test]
    fn test_peer_errors_convert() {
        let peer = EndpointId::generate();
        assert_eq!(
            PeerStoreError::from(PeerError::PeerUnreachable(peer)),
            PeerStoreError::PeerUnreachable(peer)
        );
        // One expired wait says nothing about how many attempts were made
        assert_eq!(PeerStoreError::from(PeerError::Timeout), PeerStoreError::PeerTimeout);
        assert!(PeerStoreError::from(PeerError::Timeout).is_retryable());
        assert_eq!(
            PeerStoreError::from(PeerError::TooLarge { size: 10, max: 4 }),
            PeerStoreError::ObjectTooLarge { size: 10, max: 4 }
        );
        assert!(!PeerStoreError::from(PeerError::PeerUnreachable(peer)).is_retryable());
    }

    #[test]
    fn test_relay_rejection_converts() {
        let err: PeerStoreError = RelayClientError::Rejected(ErrorCode::AuthInvalid).into();
        assert!(matches!(err, PeerStoreError::RegistrationRejected(_)));
        assert!(err.to_string().contains(ErrorCode::AuthInvalid.as_str()));
    }
}
