// Peer data protocol types — requests and responses multiplexed over a peer channel

use crate::identity::{EndpointId, ObjectId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Object operation carried by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Get,
    Put,
    Exists,
    Evict,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "GET",
            Operation::Put => "PUT",
            Operation::Exists => "EXISTS",
            Operation::Evict => "EVICT",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    NotFound,
    TooLarge,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique per channel; the only thing responses are matched on
    pub request_id: u64,
    pub operation: Operation,
    pub object_id: ObjectId,
    pub payload: Option<Vec<u8>>,
    /// Caller's remaining budget in milliseconds when the request was sent
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub status: ResponseStatus,
    pub payload: Option<Vec<u8>>,
    /// Human-readable detail for `Error`
    pub message: Option<String>,
    /// Size limit that was exceeded, set with `TooLarge`
    pub limit: Option<u64>,
    /// Size of the rejected object when known, set with `TooLarge`
    pub size: Option<u64>,
}

impl ResponseEnvelope {
    pub fn ok(request_id: u64, payload: Option<Vec<u8>>) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Ok,
            payload,
            message: None,
            limit: None,
            size: None,
        }
    }

    pub fn not_found(request_id: u64) -> Self {
        Self {
            request_id,
            status: ResponseStatus::NotFound,
            payload: None,
            message: None,
            limit: None,
            size: None,
        }
    }

    pub fn too_large(request_id: u64, size: Option<u64>, limit: u64) -> Self {
        Self {
            request_id,
            status: ResponseStatus::TooLarge,
            payload: None,
            message: None,
            limit: Some(limit),
            size,
        }
    }

    pub fn error(request_id: u64, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Error,
            payload: None,
            message: Some(message.into()),
            limit: None,
            size: None,
        }
    }
}

/// Frames exchanged on a negotiated peer channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerFrame {
    /// First frame from the dialing side, naming the negotiated session.
    /// Both hello frames announce the largest object the sender accepts.
    Hello {
        session_id: Uuid,
        endpoint_id: EndpointId,
        max_object_size: u64,
    },
    HelloAck {
        endpoint_id: EndpointId,
        max_object_size: u64,
    },
    HelloReject {
        reason: String,
    },
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

impl PeerFrame {
    pub fn frame_type(&self) -> &'static str {
        match self {
            PeerFrame::Hello { .. } => "Hello",
            PeerFrame::HelloAck { .. } => "HelloAck",
            PeerFrame::HelloReject { .. } => "HelloReject",
            PeerFrame::Request(_) => "Request",
            PeerFrame::Response(_) => "Response",
        }
    }
}
