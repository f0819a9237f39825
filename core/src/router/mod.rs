//! Request routing
//!
//! Outbound operations are resolved against the key's owner; inbound peer
//! requests are served from the local store.

pub mod handler;
pub mod request_router;

pub use handler::LocalRequestHandler;
pub use request_router::{Outcome, RequestRouter, RouterConfig};
