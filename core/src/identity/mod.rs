// Identity — endpoint identifiers, object keys and the per-process endpoint identity

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of an endpoint (UUID v4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(Uuid);

impl EndpointId {
    /// Generate a fresh random endpoint id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight hex characters, for log lines
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EndpointId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| IdentityError::InvalidEndpointId(s.to_string()))
    }
}

/// Opaque object identifier, unique within its owning endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random UUID-based object id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Globally unique object key: the owning endpoint plus the object id.
///
/// The owner is fixed at creation; the owning endpoint is the only one
/// that ever stores or evicts the object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub owner: EndpointId,
    pub object_id: ObjectId,
}

impl Key {
    pub fn new(owner: EndpointId, object_id: impl Into<ObjectId>) -> Self {
        Self {
            owner,
            object_id: object_id.into(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.object_id)
    }
}

impl FromStr for Key {
    type Err = IdentityError;

    /// Parses the `<endpoint-uuid>/<object-id>` form produced by `Display`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (owner, object_id) = s
            .split_once('/')
            .ok_or_else(|| IdentityError::InvalidKey(s.to_string()))?;
        if object_id.is_empty() {
            return Err(IdentityError::InvalidKey(s.to_string()));
        }
        Ok(Self::new(owner.parse()?, object_id))
    }
}

/// Immutable identity of the running endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointIdentity {
    pub endpoint_id: EndpointId,
    pub display_name: String,
    /// Address the peer listener binds to
    pub listen_address: SocketAddr,
    /// Relay to register with; `None` runs the endpoint solo
    pub relay_address: Option<String>,
}

impl EndpointIdentity {
    pub fn new(
        endpoint_id: EndpointId,
        display_name: impl Into<String>,
        listen_address: SocketAddr,
        relay_address: Option<String>,
    ) -> Result<Self, IdentityError> {
        let display_name = display_name.into();
        validate_name(&display_name)?;
        Ok(Self {
            endpoint_id,
            display_name,
            listen_address,
            relay_address,
        })
    }
}

/// Endpoint names are non-empty and limited to ASCII alphanumerics, `-` and `_`
pub fn validate_name(name: &str) -> Result<(), IdentityError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(IdentityError::InvalidName(name.to_string()))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid endpoint id: {0}")]
    InvalidEndpointId(String),
    #[error("Invalid key (expected <endpoint-uuid>/<object-id>): {0}")]
    InvalidKey(String),
    #[error("Invalid endpoint name {0:?}: use letters, digits, '-' or '_'")]
    InvalidName(String),
}
