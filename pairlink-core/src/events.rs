//! Notifications delivered to the consumer: establishment, received data, send failures, session end.

use tokio::sync::mpsc;

use crate::error::{ErrorKind, LinkError};
use crate::establisher::Role;
use crate::identity::SessionId;
use crate::session::{EndReason, Session};

/// Sending side of the observer channel, cloned into every establisher and session.
pub type EventSender = mpsc::UnboundedSender<LinkEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Everything the core reports. Per session, `Received` events arrive in read order and
/// `Ended` is the last event carrying that session's id.
#[derive(Debug)]
pub enum LinkEvent {
    Established { session: Session, role: Role },
    EstablishFailed { role: Role, error: LinkError },
    Received { session_id: SessionId, data: Vec<u8> },
    SendFailed { session_id: SessionId, error: ErrorKind },
    Ended { session_id: SessionId, reason: EndReason },
}

impl LinkEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            LinkEvent::Established { session, .. } => Some(session.id()),
            LinkEvent::EstablishFailed { .. } => None,
            LinkEvent::Received { session_id, .. }
            | LinkEvent::SendFailed { session_id, .. }
            | LinkEvent::Ended { session_id, .. } => Some(*session_id),
        }
    }
}
