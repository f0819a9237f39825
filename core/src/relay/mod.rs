//! Relay signaling
//!
//! A relay server keeps one registered session per endpoint and forwards
//! signaling envelopes between them. It never carries object payloads;
//! endpoints use it only to negotiate direct channels.

pub mod auth;
pub mod client;
pub mod protocol;
pub mod server;

pub use auth::{AuthError, Authenticator, NullAuthenticator, TokenAuthenticator, UserId};
pub use client::{ConnectionState, RelayClient, RelayClientConfig, RelayClientError};
pub use protocol::{
    EnvelopeError, EnvelopeKind, ErrorCode, RelayFrame, RelayProtocolError, SignalingEnvelope,
    DEFAULT_MAX_MESSAGE_BYTES,
};
pub use server::{
    RelayServer, RelayServerConfig, RelayServerError, RelayServerHandle, RelayServerStats,
};
