//! In-process transport over `tokio::io::duplex`, with open/released stream accounting.
//!
//! Endpoints share a [`MemoryNetwork`]; a listener registers (endpoint address, service id)
//! and dialers reach it by that pair. Used by hosts that pair two components inside one
//! process and by tests that need leak detection.

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use crate::identity::{PeerAddress, PeerIdentity, ServiceId};
use crate::transport::{Transport, TransportListener};

const DUPLEX_CAPACITY: usize = 64 * 1024;

type Registry = HashMap<(PeerAddress, ServiceId), mpsc::UnboundedSender<MemoryStream>>;

#[derive(Debug, Default)]
struct NetworkState {
    listeners: Mutex<Registry>,
    black_holes: Mutex<HashSet<PeerAddress>>,
    open: AtomicUsize,
    released: AtomicUsize,
}

impl NetworkState {
    fn listeners(&self) -> MutexGuard<'_, Registry> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared in-memory "radio": all endpoints created from one network can reach each other.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<NetworkState>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for the endpoint named `address`.
    pub fn endpoint(&self, address: impl Into<PeerAddress>) -> MemoryTransport {
        MemoryTransport {
            state: self.state.clone(),
            local: address.into(),
        }
    }

    /// Connects to `address` never complete until the attempt is dropped.
    pub fn add_black_hole(&self, address: impl Into<PeerAddress>) {
        self.state
            .black_holes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.into());
    }

    /// Stream ends created and not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Stream ends dropped so far.
    pub fn released_streams(&self) -> usize {
        self.state.released.load(Ordering::SeqCst)
    }

    fn stream(&self, inner: DuplexStream) -> MemoryStream {
        self.state.open.fetch_add(1, Ordering::SeqCst);
        MemoryStream {
            inner,
            state: self.state.clone(),
        }
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    state: Arc<NetworkState>,
    local: PeerAddress,
}

impl MemoryTransport {
    pub fn address(&self) -> &PeerAddress {
        &self.local
    }

    fn network(&self) -> MemoryNetwork {
        MemoryNetwork {
            state: self.state.clone(),
        }
    }

    fn is_black_hole(&self, address: &PeerAddress) -> bool {
        self.state
            .black_holes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(address)
    }
}

impl Transport for MemoryTransport {
    type Stream = MemoryStream;
    type Listener = MemoryListener;

    async fn listen(&self, service_id: ServiceId) -> io::Result<MemoryListener> {
        let key = (self.local.clone(), service_id);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut listeners = self.state.listeners();
            if listeners.contains_key(&key) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} already listening on {}", key.0, service_id),
                ));
            }
            listeners.insert(key.clone(), tx.clone());
        }
        Ok(MemoryListener {
            state: self.state.clone(),
            key,
            registration: tx,
            incoming: rx,
        })
    }

    async fn connect(&self, peer: &PeerIdentity) -> io::Result<MemoryStream> {
        if self.is_black_hole(peer.address()) {
            std::future::pending::<()>().await;
        }
        let key = (peer.address().clone(), peer.service_id());
        let listener = self.state.listeners().get(&key).cloned();
        let Some(listener) = listener else {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing listening on {}", peer),
            ));
        };
        let (ours, theirs) = tokio::io::duplex(DUPLEX_CAPACITY);
        let network = self.network();
        let ours = network.stream(ours);
        let theirs = network.stream(theirs);
        listener.send(theirs).map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed")
        })?;
        Ok(ours)
    }
}

/// Registered listening endpoint. Dropping it unregisters and drops queued streams.
#[derive(Debug)]
pub struct MemoryListener {
    state: Arc<NetworkState>,
    key: (PeerAddress, ServiceId),
    registration: mpsc::UnboundedSender<MemoryStream>,
    incoming: mpsc::UnboundedReceiver<MemoryStream>,
}

impl TransportListener for MemoryListener {
    type Stream = MemoryStream;

    async fn accept(&mut self) -> io::Result<MemoryStream> {
        // `registration` keeps the channel open, so `None` cannot happen while we exist.
        self.incoming
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener closed"))
    }

    fn local_address(&self) -> io::Result<PeerAddress> {
        Ok(self.key.0.clone())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let mut listeners = self.state.listeners();
        if listeners
            .get(&self.key)
            .map(|tx| tx.same_channel(&self.registration))
            .unwrap_or(false)
        {
            listeners.remove(&self.key);
        }
    }
}

/// One end of an in-memory duplex stream.
#[derive(Debug)]
pub struct MemoryStream {
    inner: DuplexStream,
    state: Arc<NetworkState>,
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.state.open.fetch_sub(1, Ordering::SeqCst);
        self.state.released.fetch_add(1, Ordering::SeqCst);
    }
}
