//! Pairlink wire protocol: handshake and discovery message types, version.

use serde::{Deserialize, Serialize};

use crate::identity::ServiceId;

/// Current protocol version. Carried in the handshake and in beacons.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
/// Only the handshake and discovery use frames; session payloads are raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Dialer -> listener: which service this connection is for.
    Hello {
        protocol_version: u8,
        service_id: ServiceId,
    },
    /// Listener -> dialer: whether the service id matched.
    HelloAck { accepted: bool },
    /// Discovery: a listening host advertises its service and transport port.
    Beacon {
        protocol_version: u8,
        service_id: ServiceId,
        listen_port: u16,
        name: String,
    },
}
