//! TCP transport: bind a socket address, negotiate the service id with a one-frame handshake.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpStream};

use crate::identity::{PeerAddress, PeerIdentity, ServiceId};
use crate::protocol::{Message, PROTOCOL_VERSION};
use crate::transport::{Transport, TransportListener};
use crate::wire::{read_frame, write_frame};

/// Upper bound for an inbound handshake so a silent dialer cannot stall accept.
const INBOUND_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP transport. Listeners bind `bind_addr`; dialers resolve the peer address as `host:port`.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    bind_addr: SocketAddr,
}

impl TcpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self { bind_addr }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }
}

impl Transport for TcpTransport {
    type Stream = TcpStream;
    type Listener = TcpServiceListener;

    async fn listen(&self, service_id: ServiceId) -> io::Result<TcpServiceListener> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        tracing::debug!(addr = %listener.local_addr()?, service = %service_id, "tcp listener bound");
        Ok(TcpServiceListener {
            listener,
            service_id,
        })
    }

    async fn connect(&self, peer: &PeerIdentity) -> io::Result<TcpStream> {
        let addr = resolve(peer.address()).await?;
        let mut stream = TcpStream::connect(addr).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(addr = %addr, error = %e, "failed to set TCP_NODELAY");
        }
        handshake_connect(&mut stream, peer.service_id()).await?;
        Ok(stream)
    }
}

/// Bound TCP listener that only hands out streams whose dialer asked for `service_id`.
#[derive(Debug)]
pub struct TcpServiceListener {
    listener: TcpListener,
    service_id: ServiceId,
}

impl TransportListener for TcpServiceListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<TcpStream> {
        loop {
            let (mut stream, addr) = self.listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::warn!(addr = %addr, error = %e, "failed to set TCP_NODELAY");
            }
            let handshake = tokio::time::timeout(
                INBOUND_HANDSHAKE_TIMEOUT,
                handshake_accept(&mut stream, self.service_id),
            )
            .await;
            match handshake {
                Ok(Ok(())) => return Ok(stream),
                Ok(Err(e)) => {
                    tracing::debug!(addr = %addr, error = %e, "rejected inbound connection");
                }
                Err(_) => {
                    tracing::debug!(addr = %addr, "inbound handshake timed out");
                }
            }
        }
    }

    fn local_address(&self) -> io::Result<PeerAddress> {
        self.listener.local_addr().map(PeerAddress::from)
    }
}

async fn resolve(address: &PeerAddress) -> io::Result<SocketAddr> {
    if let Ok(addr) = address.as_str().parse::<SocketAddr>() {
        return Ok(addr);
    }
    lookup_host(address.as_str()).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address for {}", address),
        )
    })
}

async fn handshake_accept(stream: &mut TcpStream, service_id: ServiceId) -> io::Result<()> {
    let (accepted, reason) = match read_frame(stream).await? {
        Message::Hello {
            protocol_version,
            service_id: requested,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                (false, "unsupported protocol version")
            } else if requested != service_id {
                (false, "service id mismatch")
            } else {
                (true, "")
            }
        }
        _ => (false, "expected hello"),
    };
    write_frame(stream, &Message::HelloAck { accepted }).await?;
    if accepted {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::InvalidData, reason))
    }
}

async fn handshake_connect(stream: &mut TcpStream, service_id: ServiceId) -> io::Result<()> {
    let hello = Message::Hello {
        protocol_version: PROTOCOL_VERSION,
        service_id,
    };
    write_frame(stream, &hello).await?;
    match read_frame(stream).await? {
        Message::HelloAck { accepted: true } => Ok(()),
        Message::HelloAck { accepted: false } => Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "peer refused service id",
        )),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected hello ack",
        )),
    }
}
