//! Terminal chat over an established session: input lines go out, received chunks are printed.

use std::future::Future;

use pairlink_core::{EndReason, ErrorKind, EventReceiver, LinkEvent, Session};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Shown when a send fails; the session is torn down right after.
pub const SEND_FAILED_NOTICE: &str = "couldn't send data to the other device";

/// Run until the session ends, input reaches EOF, or `shutdown` resolves. The last two
/// close the session first.
pub async fn run<I, O, F>(
    session: Session,
    events: &mut EventReceiver,
    input: I,
    output: &mut O,
    shutdown: F,
) -> anyhow::Result<()>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut lines = input.lines();
    let mut input_open = true;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                session.close().await;
                return Ok(());
            }
            line = lines.next_line(), if input_open => match line? {
                Some(line) => {
                    let mut payload = line.into_bytes();
                    payload.push(b'\n');
                    // A peer that stops reading parks the send; shutdown must still get through.
                    let sent = tokio::select! {
                        _ = &mut shutdown => {
                            session.close().await;
                            return Ok(());
                        }
                        sent = session.send(&payload) => sent,
                    };
                    if let Err(e) = sent {
                        // WriteFailed is reported through SendFailed below.
                        if e.kind() == ErrorKind::AlreadyClosed {
                            tracing::debug!(session = %session.id(), "dropping input, session closed");
                        }
                    }
                }
                None => {
                    input_open = false;
                    session.close().await;
                }
            },
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };
                if event.session_id() != Some(session.id()) {
                    continue;
                }
                match event {
                    LinkEvent::Received { data, .. } => {
                        output.write_all(String::from_utf8_lossy(&data).as_bytes()).await?;
                        output.flush().await?;
                    }
                    LinkEvent::SendFailed { .. } => {
                        output.write_all(format!("{}\n", SEND_FAILED_NOTICE).as_bytes()).await?;
                        output.flush().await?;
                    }
                    LinkEvent::Ended { reason, .. } => {
                        let notice = match reason {
                            EndReason::Closed => "disconnected".to_string(),
                            EndReason::PeerClosed => "peer disconnected".to_string(),
                            EndReason::Failed(kind) => format!("connection lost ({})", kind),
                        };
                        output.write_all(format!("-- {}\n", notice).as_bytes()).await?;
                        output.flush().await?;
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}
