//! Peer identity: service ids (role-negotiation tokens), opaque peer addresses, session ids.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known service id the chat peers register under by default.
pub const DEFAULT_SERVICE_ID: ServiceId =
    ServiceId(Uuid::from_u128(0x8ce255c0_200a_11e0_ac64_0800200c9a66));

/// Service name advertised next to [`DEFAULT_SERVICE_ID`].
pub const DEFAULT_SERVICE_NAME: &str = "Tutorial2";

/// Service id (128-bit UUID). A listener and a dialer only pair when their ids match.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(Uuid);

impl ServiceId {
    pub fn from_uuid(uuid: Uuid) -> Self {
        ServiceId(uuid)
    }

    /// Fresh random service id (v4).
    pub fn random() -> Self {
        ServiceId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        DEFAULT_SERVICE_ID
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ServiceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ServiceId)
    }
}

/// Opaque transport address. Each transport decides how to interpret it.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        PeerAddress(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        PeerAddress::new(s)
    }
}

impl From<String> for PeerAddress {
    fn from(s: String) -> Self {
        PeerAddress(s)
    }
}

impl From<std::net::SocketAddr> for PeerAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        PeerAddress(addr.to_string())
    }
}

/// Who to dial: resolved address plus the service id the remote listener registered.
/// Immutable once an attempt starts.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PeerIdentity {
    address: PeerAddress,
    service_id: ServiceId,
}

impl PeerIdentity {
    pub fn new(address: impl Into<PeerAddress>, service_id: ServiceId) -> Self {
        Self {
            address: address.into(),
            service_id,
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.service_id)
    }
}

/// Random id assigned to a session when it opens; tags its notifications.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn generate() -> Self {
        SessionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell sessions apart in logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}
