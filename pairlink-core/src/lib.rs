//! Pairlink: paired duplex-stream sessions between two peers.
//! One side listens under a service id, the other dials it; the resulting session relays
//! raw byte chunks both ways until either side closes.

pub mod config;
pub mod discovery;
pub mod error;
pub mod establisher;
pub mod events;
pub mod identity;
pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;
pub mod wire;

pub use config::{SessionConfig, DEFAULT_READ_BUFFER_SIZE};
pub use discovery::{Discovery, NoDiscovery};
pub use error::{ErrorKind, LinkError, LinkResult};
pub use establisher::{ConnectionAttempt, ConnectionEstablisher, EstablishHandle, Role};
pub use events::{event_channel, EventReceiver, EventSender, LinkEvent};
pub use identity::{
    PeerAddress, PeerIdentity, ServiceId, SessionId, DEFAULT_SERVICE_ID, DEFAULT_SERVICE_NAME,
};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use service::ConnectionService;
pub use session::{EndReason, Session, SessionState};
pub use transport::{
    MemoryNetwork, MemoryTransport, TcpServiceListener, TcpTransport, Transport,
    TransportListener,
};
pub use wire::{decode_frame, encode_frame, read_frame, write_frame, FrameDecodeError, FrameEncodeError};
