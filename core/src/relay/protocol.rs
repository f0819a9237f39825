//! Relay signaling protocol — envelopes, frames and serialization
//!
//! Frames travel as u32 length-prefixed MessagePack maps with named fields,
//! so both sides can evolve fields without breaking older peers.

use crate::identity::EndpointId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cap on a single signaling frame: 1 MiB
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Signaling envelope kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Register,
    Offer,
    Answer,
    Candidate,
    Error,
}

/// Error codes carried in the header of an ERROR envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Relay holds no live session for the recipient
    PeerUnreachable,
    /// Credentials missing, invalid, expired or for another audience
    AuthInvalid,
    /// Endpoint id or recipient belongs to a different user
    Forbidden,
    /// A live session already holds this endpoint id
    Duplicate,
    /// Relay connection limit reached
    ServerFull,
    /// Recipient's outbound queue is full
    RecipientBusy,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PeerUnreachable => "peer unreachable",
            ErrorCode::AuthInvalid => "authentication invalid",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::Duplicate => "duplicate endpoint id",
            ErrorCode::ServerFull => "server full",
            ErrorCode::RecipientBusy => "recipient busy",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub code: ErrorCode,
    pub message: String,
}

/// Signaling envelope relayed between endpoints.
///
/// The relay routes on `kind`, `sender_id` and `recipient_id` only; `payload`
/// is opaque to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub kind: EnvelopeKind,
    pub sender_id: EndpointId,
    pub recipient_id: EndpointId,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// REGISTER only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// REGISTER only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
    /// ERROR only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

impl SignalingEnvelope {
    /// Envelope addressed from `sender_id` to `recipient_id`
    pub fn new(
        kind: EnvelopeKind,
        sender_id: EndpointId,
        recipient_id: EndpointId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            sender_id,
            recipient_id,
            payload,
            name: None,
            credentials: None,
            error: None,
        }
    }

    pub fn register(endpoint_id: EndpointId, name: String, credentials: Option<String>) -> Self {
        Self {
            name: Some(name),
            credentials,
            ..Self::new(EnvelopeKind::Register, endpoint_id, endpoint_id, Vec::new())
        }
    }

    /// Bounce an undeliverable envelope back to its sender, payload intact
    pub fn bounce(original: &SignalingEnvelope, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: Some(EnvelopeError {
                code,
                message: message.into(),
            }),
            ..Self::new(
                EnvelopeKind::Error,
                original.recipient_id,
                original.sender_id,
                original.payload.clone(),
            )
        }
    }

    /// ERROR envelope answering a REGISTER
    pub fn rejection(endpoint_id: EndpointId, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: Some(EnvelopeError {
                code,
                message: message.into(),
            }),
            ..Self::new(EnvelopeKind::Error, endpoint_id, endpoint_id, Vec::new())
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// A frame on the relay connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    Envelope(SignalingEnvelope),
    /// Registration accepted
    Registered { endpoint_id: EndpointId },
    /// Keep-alive ping
    Ping,
    /// Ping response
    Pong,
}

/// Relay frame serialization errors
#[derive(Debug, Error)]
pub enum RelayProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl RelayFrame {
    /// Serialize to MessagePack with named fields
    pub fn to_bytes(&self) -> Result<Vec<u8>, RelayProtocolError> {
        rmp_serde::to_vec_named(self)
            .map_err(|e| RelayProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RelayProtocolError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| RelayProtocolError::DeserializationError(e.to_string()))
    }

    /// Get a human-readable description of the frame type
    pub fn frame_type(&self) -> &'static str {
        match self {
            RelayFrame::Envelope(env) => match env.kind {
                EnvelopeKind::Register => "Register",
                EnvelopeKind::Offer => "Offer",
                EnvelopeKind::Answer => "Answer",
                EnvelopeKind::Candidate => "Candidate",
                EnvelopeKind::Error => "Error",
            },
            RelayFrame::Registered { .. } => "Registered",
            RelayFrame::Ping => "Ping",
            RelayFrame::Pong => "Pong",
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_envelope_fields() {
        let id = EndpointId::generate();
        let env = SignalingEnvelope::register(id, "alpha".into(), Some("token".into()));
        assert_eq!(env.kind, EnvelopeKind::Register);
        assert_eq!(env.sender_id, id);
        assert_eq!(env.name.as_deref(), Some("alpha"));

        let decoded = RelayFrame::from_bytes(&RelayFrame::Envelope(env.clone()).to_bytes().unwrap())
            .unwrap();
        assert_eq!(decoded, RelayFrame::Envelope(env));
    }

    #[test]
    fn test_bounce_swaps_addresses_and_keeps_payload() {
        let a = EndpointId::generate();
        let b = EndpointId::generate();
        let offer = SignalingEnvelope::new(EnvelopeKind::Offer, a, b, b"sdp".to_vec());
        let bounced = SignalingEnvelope::bounce(&offer, ErrorCode::PeerUnreachable, "gone");

        assert_eq!(bounced.kind, EnvelopeKind::Error);
        assert_eq!(bounced.sender_id, b);
        assert_eq!(bounced.recipient_id, a);
        assert_eq!(bounced.payload, b"sdp");
        assert_eq!(bounced.error_code(), Some(ErrorCode::PeerUnreachable));
    }

    #[test]
    fn test_frame_uses_named_fields() {
        let env = SignalingEnvelope::new(
            EnvelopeKind::Candidate,
            EndpointId::generate(),
            EndpointId::generate(),
            vec![0xAB; 4],
        );
        let bytes = RelayFrame::Envelope(env).to_bytes().unwrap();
        // Field names are on the wire, optional headers are not
        let as_text = String::from_utf8_lossy(&bytes);
        assert!(as_text.contains("recipient_id"));
        assert!(!as_text.contains("credentials"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(RelayFrame::from_bytes(&[0xc1, 0x00, 0x13]).is_err());
        assert_eq!(RelayFrame::Ping.frame_type(), "Ping");
    }
}
