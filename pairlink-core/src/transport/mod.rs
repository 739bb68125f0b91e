//! Transport contract consumed by the core: listen, accept, connect, and duplex byte streams.
//!
//! A stream's read/write are the `AsyncRead`/`AsyncWrite` impls; closing a stream is
//! shutting it down and dropping it. Every operation suspends the calling task until
//! it completes, and dropping the in-flight future (or the endpoint) abandons it.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::{PeerAddress, PeerIdentity, ServiceId};

pub mod memory;
pub mod tcp;

pub use memory::{MemoryListener, MemoryNetwork, MemoryStream, MemoryTransport};
pub use tcp::{TcpServiceListener, TcpTransport};

/// A connectable, listenable source of duplex byte streams.
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    type Listener: TransportListener<Stream = Self::Stream>;

    /// Open a listening endpoint registered under `service_id`.
    fn listen(
        &self,
        service_id: ServiceId,
    ) -> impl Future<Output = io::Result<Self::Listener>> + Send;

    /// Open an outbound stream to `peer`. Completes once the remote side has
    /// accepted the service id, or fails.
    fn connect(
        &self,
        peer: &PeerIdentity,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Listening endpoint. Dropping it closes the endpoint.
pub trait TransportListener: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next inbound stream for this endpoint's service id.
    fn accept(&mut self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Address a dialer should use to reach this endpoint.
    fn local_address(&self) -> io::Result<PeerAddress>;
}
