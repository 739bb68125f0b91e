//! Error taxonomy reported to callers instead of raw I/O errors.

use std::fmt;
use std::io;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BindFailed,
    AcceptFailed,
    /// Refusal, timeout, no route, or cancellation of a dial.
    ConnectFailed,
    /// Local read error. A peer that closes gracefully ends the session with
    /// [`EndReason::PeerClosed`](crate::session::EndReason::PeerClosed) instead.
    ReadFailed,
    WriteFailed,
    /// Operation attempted after teardown.
    AlreadyClosed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::BindFailed => "bind failed",
            ErrorKind::AcceptFailed => "accept failed",
            ErrorKind::ConnectFailed => "connect failed",
            ErrorKind::ReadFailed => "read failed",
            ErrorKind::WriteFailed => "write failed",
            ErrorKind::AlreadyClosed => "already closed",
        };
        f.write_str(s)
    }
}

/// Failure of a link operation, carrying the underlying I/O cause where there is one.
/// Read failures end the session and surface only as `EndReason::Failed(ReadFailed)`.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("failed to open listening endpoint: {0}")]
    BindFailed(#[source] io::Error),
    #[error("failed to accept inbound connection: {0}")]
    AcceptFailed(#[source] io::Error),
    #[error("failed to connect to peer: {0}")]
    ConnectFailed(#[source] io::Error),
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),
    #[error("session already closed")]
    AlreadyClosed,
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::BindFailed(_) => ErrorKind::BindFailed,
            LinkError::AcceptFailed(_) => ErrorKind::AcceptFailed,
            LinkError::ConnectFailed(_) => ErrorKind::ConnectFailed,
            LinkError::WriteFailed(_) => ErrorKind::WriteFailed,
            LinkError::AlreadyClosed => ErrorKind::AlreadyClosed,
        }
    }

    /// True when the attempt was interrupted by `cancel()` rather than failing on its own.
    /// An `Interrupted` error raised by the transport itself does not count.
    pub fn is_cancelled(&self) -> bool {
        self.io_error()
            .and_then(|e| e.get_ref())
            .map(|inner| inner.is::<Cancelled>())
            .unwrap_or(false)
    }

    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            LinkError::BindFailed(e)
            | LinkError::AcceptFailed(e)
            | LinkError::ConnectFailed(e)
            | LinkError::WriteFailed(e) => Some(e),
            LinkError::AlreadyClosed => None,
        }
    }
}

pub type LinkResult<T> = Result<T, LinkError>;

/// Payload marking an I/O error as a local cancellation.
#[derive(Debug, thiserror::Error)]
#[error("attempt cancelled")]
struct Cancelled;

/// I/O error used when a blocked accept/connect is interrupted by closing its endpoint.
pub(crate) fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, Cancelled)
}
