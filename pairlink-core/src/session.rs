//! Session: owns an established stream, relays received chunks to the observer, serializes sends.
//!
//! State walks Open -> Closing -> Closed. Whoever moves it out of Open (explicit `close`,
//! a failed write, or the receive loop seeing EOF/error) records the end reason; the
//! receive loop alone then releases the stream and emits `Ended`, so release and the
//! end notification happen exactly once. Dropping the event receiver closes the session.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::config::SessionConfig;
use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::establisher::Role;
use crate::events::{EventSender, LinkEvent};
use crate::identity::SessionId;

/// Lifecycle shared by an establishment attempt and the session it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Open => write!(f, "open"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// `close()` was called locally.
    Closed,
    /// The peer closed its side (read returned 0).
    PeerClosed,
    /// A read or write failed.
    Failed(ErrorKind),
}

pub(crate) type StateCell = Arc<watch::Sender<SessionState>>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Shared {
    id: SessionId,
    role: Role,
    state: StateCell,
    end_reason: Mutex<Option<EndReason>>,
    writer: AsyncMutex<Option<BoxedWriter>>,
    events: EventSender,
}

impl Shared {
    /// Open -> Closing. Returns false if someone else already left Open.
    fn begin_closing(&self, reason: EndReason) -> bool {
        self.state.send_if_modified(|state| {
            if *state != SessionState::Open {
                return false;
            }
            *state = SessionState::Closing;
            *self.end_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
            true
        })
    }

    fn take_end_reason(&self) -> EndReason {
        self.end_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or(EndReason::Closed)
    }

    /// Takes the write half out under the send lock and shuts it down. An in-flight send
    /// gives the lock up as soon as the state leaves Open.
    async fn release_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(session = %self.id, error = %e, "shutdown on release failed");
            }
        }
    }
}

/// Handle to an established session. Cheap to clone; all clones address the same stream.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Takes ownership of `stream`, announces the session, then starts its receive loop.
    pub(crate) fn open<S>(
        stream: S,
        role: Role,
        state: StateCell,
        config: &SessionConfig,
        events: EventSender,
    ) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            id: SessionId::generate(),
            role,
            state,
            end_reason: Mutex::new(None),
            writer: AsyncMutex::new(Some(Box::new(writer))),
            events,
        });
        shared.state.send_replace(SessionState::Open);
        tracing::info!(session = %shared.id, role = %role, "session open");

        let session = Session {
            shared: shared.clone(),
        };
        // Established goes out before the loop can produce any Received event.
        let _ = shared.events.send(LinkEvent::Established {
            session: session.clone(),
            role,
        });
        tokio::spawn(receive_loop(shared, reader, config.buffer_len()));
        session
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Write the whole payload. Concurrent callers are serialized, so one payload's bytes
    /// are never interleaved with another's.
    ///
    /// A write error is reported once as `SendFailed` and tears the session down; the
    /// caller gets `WriteFailed`. After teardown has started the result is `AlreadyClosed`.
    pub async fn send(&self, payload: &[u8]) -> LinkResult<()> {
        let mut closing = self.shared.state.subscribe();
        let mut writer = self.shared.writer.lock().await;
        if !self.is_open() {
            return Err(LinkError::AlreadyClosed);
        }
        let Some(stream) = writer.as_mut() else {
            return Err(LinkError::AlreadyClosed);
        };
        let written = tokio::select! {
            biased;
            _ = wait_until_closing(&mut closing) => return Err(LinkError::AlreadyClosed),
            result = write_payload(stream, payload) => result,
        };

        match written {
            Ok(()) => {
                tracing::trace!(session = %self.shared.id, len = payload.len(), "sent");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session = %self.shared.id, error = %e, "write failed, closing session");
                // Still holding the send lock: the receive loop cannot emit Ended before this.
                let _ = self.shared.events.send(LinkEvent::SendFailed {
                    session_id: self.shared.id,
                    error: ErrorKind::WriteFailed,
                });
                self.shared
                    .begin_closing(EndReason::Failed(ErrorKind::WriteFailed));
                drop(writer);
                Err(LinkError::WriteFailed(e))
            }
        }
    }

    /// Tear the session down and wait until the stream is released. Idempotent and safe to
    /// call concurrently with reads, sends, or other `close` calls.
    pub async fn close(&self) {
        if self.shared.begin_closing(EndReason::Closed) {
            tracing::debug!(session = %self.shared.id, "close requested");
        }
        self.closed().await;
    }

    /// Wait until the session reaches Closed, however it gets there.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish()
    }
}

async fn write_payload<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(payload).await?;
    writer.flush().await
}

async fn wait_until_closing(state: &mut watch::Receiver<SessionState>) {
    let _ = state.wait_for(|s| *s != SessionState::Open).await;
}

async fn receive_loop<R>(shared: Arc<Shared>, mut reader: ReadHalf<R>, buffer_len: usize)
where
    R: AsyncRead + Send + 'static,
{
    let mut closing = shared.state.subscribe();
    let mut buf = vec![0u8; buffer_len];
    let detected = loop {
        tokio::select! {
            biased;
            _ = wait_until_closing(&mut closing) => break None,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Some(EndReason::PeerClosed),
                Ok(n) => {
                    tracing::trace!(session = %shared.id, len = n, "received");
                    let delivered = shared.events.send(LinkEvent::Received {
                        session_id: shared.id,
                        data: buf[..n].to_vec(),
                    });
                    if delivered.is_err() {
                        tracing::debug!(session = %shared.id, "observer gone, closing session");
                        break Some(EndReason::Closed);
                    }
                }
                Err(e) => {
                    tracing::warn!(session = %shared.id, error = %e, "read failed, ending session");
                    break Some(EndReason::Failed(ErrorKind::ReadFailed));
                }
            },
            _ = shared.events.closed() => {
                tracing::debug!(session = %shared.id, "observer gone, closing session");
                break Some(EndReason::Closed);
            }
        }
    };
    if let Some(reason) = detected {
        shared.begin_closing(reason);
    }

    drop(reader);
    shared.release_writer().await;
    let reason = shared.take_end_reason();
    shared.state.send_replace(SessionState::Closed);
    tracing::debug!(session = %shared.id, reason = ?reason, "session closed");
    let _ = shared.events.send(LinkEvent::Ended {
        session_id: shared.id,
        reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_channel, EventReceiver};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadBuf};

    /// Stream whose writes always fail; reads fail too when `fail_reads`, else never complete.
    struct FailingStream {
        fail_reads: bool,
    }

    impl AsyncRead for FailingStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.fail_reads {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            } else {
                Poll::Pending
            }
        }
    }

    impl AsyncWrite for FailingStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn open_failing(fail_reads: bool) -> (Session, EventReceiver) {
        let (tx, mut rx) = event_channel();
        let state: StateCell = Arc::new(watch::channel(SessionState::Connecting).0);
        let session = Session::open(
            FailingStream { fail_reads },
            Role::Dialing,
            state,
            &SessionConfig::default(),
            tx,
        );
        assert!(matches!(rx.try_recv(), Ok(LinkEvent::Established { .. })));
        (session, rx)
    }

    fn open_pair(buffer: usize) -> (Session, DuplexStream, EventReceiver) {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (tx, mut rx) = event_channel();
        let state: StateCell = Arc::new(watch::channel(SessionState::Connecting).0);
        let cfg = SessionConfig::default().with_read_buffer_size(buffer);
        let session = Session::open(ours, Role::Dialing, state, &cfg, tx);
        match rx.try_recv() {
            Ok(LinkEvent::Established { session: s, role }) => {
                assert_eq!(s.id(), session.id());
                assert_eq!(role, Role::Dialing);
            }
            other => panic!("expected Established, got {:?}", other),
        }
        (session, theirs, rx)
    }

    async fn next(rx: &mut EventReceiver) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn delivers_chunks_then_peer_closed() {
        let (session, mut peer, mut rx) = open_pair(1024);
        assert_eq!(session.state(), SessionState::Open);

        peer.write_all(b"hello").await.unwrap();
        match next(&mut rx).await {
            LinkEvent::Received { data, .. } => assert_eq!(data, b"hello"),
            other => panic!("unexpected {:?}", other),
        }
        drop(peer);
        match next(&mut rx).await {
            LinkEvent::Ended { reason, .. } => assert_eq!(reason, EndReason::PeerClosed),
            other => panic!("unexpected {:?}", other),
        }
        session.closed().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn chunks_bounded_by_read_buffer() {
        let (_session, mut peer, mut rx) = open_pair(4);
        peer.write_all(b"abcdefghij").await.unwrap();
        let mut got = Vec::new();
        while got.len() < 10 {
            match next(&mut rx).await {
                LinkEvent::Received { data, .. } => {
                    assert!(data.len() <= 4);
                    got.extend(data);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(got, b"abcdefghij");
    }

    #[tokio::test]
    async fn send_reaches_peer() {
        let (session, mut peer, _rx) = open_pair(1024);
        session.send(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_once() {
        let (session, mut peer, mut rx) = open_pair(1024);
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);

        match next(&mut rx).await {
            LinkEvent::Ended { reason, .. } => assert_eq!(reason, EndReason::Closed),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        // Our side shut down and dropped both halves: the peer reads EOF.
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn send_after_close_is_already_closed() {
        let (session, _peer, _rx) = open_pair(1024);
        session.close().await;
        let err = session.send(b"late").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyClosed);
    }

    #[tokio::test]
    async fn close_unblocks_stalled_send() {
        // Tiny pipe nobody reads from: the write parks once the buffer is full.
        let (ours, _theirs) = tokio::io::duplex(8);
        let (tx, _rx) = event_channel();
        let state: StateCell = Arc::new(watch::channel(SessionState::Connecting).0);
        let session = Session::open(ours, Role::Listening, state, &SessionConfig::default(), tx);

        let sender = session.clone();
        let stalled = tokio::spawn(async move { sender.send(&[7u8; 4096]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stalled.is_finished());

        tokio::time::timeout(Duration::from_secs(5), session.close())
            .await
            .expect("close must not deadlock behind a stalled send");
        let err = stalled.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyClosed);
    }

    #[tokio::test]
    async fn write_error_sends_one_failure_then_ends() {
        let (session, mut rx) = open_failing(false);
        let err = session.send(b"x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteFailed);

        match next(&mut rx).await {
            LinkEvent::SendFailed { session_id, error } => {
                assert_eq!(session_id, session.id());
                assert_eq!(error, ErrorKind::WriteFailed);
            }
            other => panic!("expected SendFailed, got {:?}", other),
        }
        match next(&mut rx).await {
            LinkEvent::Ended { reason, .. } => {
                assert_eq!(reason, EndReason::Failed(ErrorKind::WriteFailed))
            }
            other => panic!("expected Ended, got {:?}", other),
        }
        session.closed().await;
        assert_eq!(
            session.send(b"y").await.unwrap_err().kind(),
            ErrorKind::AlreadyClosed
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_error_ends_session_as_read_failed() {
        let (session, mut rx) = open_failing(true);
        match next(&mut rx).await {
            LinkEvent::Ended { session_id, reason } => {
                assert_eq!(session_id, session.id());
                assert_eq!(reason, EndReason::Failed(ErrorKind::ReadFailed));
            }
            other => panic!("expected Ended, got {:?}", other),
        }
        session.closed().await;
        assert_eq!(
            session.send(b"late").await.unwrap_err().kind(),
            ErrorKind::AlreadyClosed
        );
    }

    #[tokio::test]
    async fn dropped_observer_closes_session() {
        let (session, mut peer, rx) = open_pair(1024);
        drop(rx);
        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .expect("session must close once nobody observes it");
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn write_failure_reported_once_and_ends_session() {
        let (session, peer, mut rx) = open_pair(1024);
        drop(peer);
        // The receive loop may notice EOF first; either way sends stop succeeding.
        let first = session.send(b"x").await;
        match first {
            Err(e) => assert!(matches!(
                e.kind(),
                ErrorKind::WriteFailed | ErrorKind::AlreadyClosed
            )),
            Ok(()) => panic!("write to a dropped peer must fail"),
        }
        let mut send_failed = 0;
        loop {
            match next(&mut rx).await {
                LinkEvent::SendFailed { error, .. } => {
                    assert_eq!(error, ErrorKind::WriteFailed);
                    send_failed += 1;
                }
                LinkEvent::Ended { .. } => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(send_failed <= 1);
        assert_eq!(
            session.send(b"y").await.unwrap_err().kind(),
            ErrorKind::AlreadyClosed
        );
    }
}
