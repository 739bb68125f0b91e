//! Connection establishment: one single-use attempt in either the listening or the dialing role.
//!
//! The attempt runs on its own task. Cancelling it drops the listening endpoint or the
//! in-flight connect, which is what unblocks the parked accept/connect.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::discovery::{Discovery, NoDiscovery};
use crate::error::{self, ErrorKind, LinkError, LinkResult};
use crate::events::{EventSender, LinkEvent};
use crate::identity::{PeerAddress, PeerIdentity, ServiceId};
use crate::session::{Session, SessionState, StateCell};
use crate::transport::{Transport, TransportListener};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Waits for one inbound connection.
    Listening,
    /// Opens one outbound connection.
    Dialing,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Listening => write!(f, "listening"),
            Role::Dialing => write!(f, "dialing"),
        }
    }
}

/// Everything one attempt needs, passed by value into its establisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAttempt {
    Listen { service_id: ServiceId },
    Dial { peer: PeerIdentity },
}

impl ConnectionAttempt {
    pub fn listen(service_id: ServiceId) -> Self {
        ConnectionAttempt::Listen { service_id }
    }

    pub fn dial(peer: PeerIdentity) -> Self {
        ConnectionAttempt::Dial { peer }
    }

    pub fn role(&self) -> Role {
        match self {
            ConnectionAttempt::Listen { .. } => Role::Listening,
            ConnectionAttempt::Dial { .. } => Role::Dialing,
        }
    }
}

/// Single-use establisher. `start` consumes it; retrying needs a new one.
pub struct ConnectionEstablisher<T: Transport> {
    transport: Arc<T>,
    attempt: ConnectionAttempt,
    config: SessionConfig,
    discovery: Arc<dyn Discovery>,
    events: EventSender,
}

impl<T: Transport> ConnectionEstablisher<T> {
    pub fn new(transport: Arc<T>, attempt: ConnectionAttempt, events: EventSender) -> Self {
        Self {
            transport,
            attempt,
            config: SessionConfig::default(),
            discovery: Arc::new(NoDiscovery),
            events,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Discovery to stop before dialing.
    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = discovery;
        self
    }

    /// Spawn the attempt. The outcome is reported as `Established` or `EstablishFailed`
    /// and is also available from [`EstablishHandle::join`].
    pub fn start(self) -> EstablishHandle {
        let role = self.attempt.role();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (bound_tx, bound_rx) = watch::channel(None);
        let state: StateCell = Arc::new(watch::channel(SessionState::Connecting).0);
        let state_rx = state.subscribe();
        let task = tokio::spawn(self.run(cancel_rx, bound_tx, state));
        EstablishHandle {
            role,
            cancel: cancel_tx,
            bound: bound_rx,
            state: state_rx,
            task,
        }
    }

    async fn run(
        self,
        mut cancel: watch::Receiver<bool>,
        bound: watch::Sender<Option<PeerAddress>>,
        state: StateCell,
    ) -> Result<Session, ErrorKind> {
        let role = self.attempt.role();
        let outcome = match &self.attempt {
            ConnectionAttempt::Listen { service_id } => {
                self.accept_one(*service_id, &mut cancel, bound).await
            }
            ConnectionAttempt::Dial { peer } => self.dial(peer, &mut cancel).await,
        };
        match outcome {
            Ok(stream) => Ok(Session::open(
                stream,
                role,
                state,
                &self.config,
                self.events.clone(),
            )),
            Err(error) => {
                if error.is_cancelled() {
                    tracing::debug!(role = %role, "establishment cancelled");
                } else {
                    tracing::warn!(role = %role, error = %error, "establishment failed");
                }
                let kind = error.kind();
                state.send_replace(SessionState::Closed);
                let _ = self.events.send(LinkEvent::EstablishFailed { role, error });
                Err(kind)
            }
        }
    }

    async fn accept_one(
        &self,
        service_id: ServiceId,
        cancel: &mut watch::Receiver<bool>,
        bound: watch::Sender<Option<PeerAddress>>,
    ) -> LinkResult<T::Stream> {
        let mut listener = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(LinkError::AcceptFailed(error::cancelled())),
            listener = self.transport.listen(service_id) => listener.map_err(LinkError::BindFailed)?,
        };
        match listener.local_address() {
            Ok(addr) => {
                tracing::info!(service = %service_id, addr = %addr, "listening for one inbound connection");
                bound.send_replace(Some(addr));
            }
            Err(e) => tracing::debug!(service = %service_id, error = %e, "listener has no local address"),
        }

        let accepted = tokio::select! {
            biased;
            _ = cancelled(cancel) => Err(LinkError::AcceptFailed(error::cancelled())),
            stream = listener.accept() => stream.map_err(LinkError::AcceptFailed),
        };
        // One connection per listener: the endpoint closes here either way.
        drop(listener);
        bound.send_replace(None);
        accepted
    }

    async fn dial(
        &self,
        peer: &PeerIdentity,
        cancel: &mut watch::Receiver<bool>,
    ) -> LinkResult<T::Stream> {
        self.discovery.stop_discovery();
        tracing::debug!(peer = %peer, "dialing");
        // A cancelled connect is dropped mid-flight, closing whatever it had opened.
        tokio::select! {
            biased;
            _ = cancelled(cancel) => Err(LinkError::ConnectFailed(error::cancelled())),
            stream = self.transport.connect(peer) => stream.map_err(LinkError::ConnectFailed),
        }
    }
}

/// Resolves once `cancel()` was called. A dropped handle does not cancel.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Pending establishment attempt.
#[derive(Debug)]
pub struct EstablishHandle {
    role: Role,
    cancel: watch::Sender<bool>,
    bound: watch::Receiver<Option<PeerAddress>>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<Result<Session, ErrorKind>>,
}

impl EstablishHandle {
    pub fn role(&self) -> Role {
        self.role
    }

    /// Connecting while pending, then the produced session's state (or Closed on failure).
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Interrupt a pending accept/connect. Idempotent; no effect once the attempt finished.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Address the listening endpoint is reachable at, once it is open.
    /// `None` for dialers, and once the endpoint is closed (failed bind, accepted
    /// connection, or cancel).
    pub async fn bound_address(&self) -> Option<PeerAddress> {
        if self.role == Role::Dialing {
            return None;
        }
        wait_bound(self.bound.clone()).await
    }

    pub(crate) fn bound_watch(&self) -> watch::Receiver<Option<PeerAddress>> {
        self.bound.clone()
    }

    /// Wait for the outcome.
    pub async fn join(self) -> Result<Session, ErrorKind> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(role = %self.role, error = %e, "establishment task did not complete");
                Err(match self.role {
                    Role::Listening => ErrorKind::AcceptFailed,
                    Role::Dialing => ErrorKind::ConnectFailed,
                })
            }
        }
    }
}

pub(crate) async fn wait_bound(mut bound: watch::Receiver<Option<PeerAddress>>) -> Option<PeerAddress> {
    let addr = match bound.wait_for(|addr| addr.is_some()).await {
        Ok(addr) => addr.clone(),
        Err(_) => None,
    };
    addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_channel, EventReceiver};
    use crate::transport::MemoryNetwork;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn next(rx: &mut EventReceiver) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[derive(Default)]
    struct CountingDiscovery(AtomicUsize);

    impl Discovery for CountingDiscovery {
        fn stop_discovery(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn attempt_roles() {
        let service = ServiceId::random();
        assert_eq!(ConnectionAttempt::listen(service).role(), Role::Listening);
        let peer = PeerIdentity::new("a", service);
        assert_eq!(ConnectionAttempt::dial(peer).role(), Role::Dialing);
    }

    #[tokio::test]
    async fn listener_and_dialer_pair_up() {
        let net = MemoryNetwork::new();
        let service = ServiceId::random();
        let (tx, mut rx) = event_channel();

        let listener = ConnectionEstablisher::new(
            Arc::new(net.endpoint("a")),
            ConnectionAttempt::listen(service),
            tx.clone(),
        )
        .start();
        assert_eq!(listener.bound_address().await, Some(PeerAddress::new("a")));

        let discovery = Arc::new(CountingDiscovery::default());
        let dialer = ConnectionEstablisher::new(
            Arc::new(net.endpoint("b")),
            ConnectionAttempt::dial(PeerIdentity::new("a", service)),
            tx,
        )
        .with_discovery(discovery.clone())
        .start();
        assert_eq!(dialer.bound_address().await, None);

        let dialed = dialer.join().await.unwrap();
        let accepted = listener.join().await.unwrap();
        assert_eq!(discovery.0.load(Ordering::SeqCst), 1);
        assert_eq!(dialed.role(), Role::Dialing);
        assert_eq!(accepted.role(), Role::Listening);
        assert!(dialed.is_open() && accepted.is_open());

        let mut roles = Vec::new();
        for _ in 0..2 {
            match next(&mut rx).await {
                LinkEvent::Established { role, .. } => roles.push(role),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(roles.contains(&Role::Listening) && roles.contains(&Role::Dialing));
    }

    #[tokio::test]
    async fn cancel_interrupts_accept_and_closes_endpoint() {
        let net = MemoryNetwork::new();
        let service = ServiceId::random();
        let (tx, mut rx) = event_channel();
        let transport = Arc::new(net.endpoint("a"));

        let handle =
            ConnectionEstablisher::new(transport.clone(), ConnectionAttempt::listen(service), tx)
                .start();
        handle.bound_address().await.unwrap();
        assert_eq!(handle.state(), SessionState::Connecting);
        handle.cancel();
        handle.cancel();
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.state(), SessionState::Closed);
        assert_eq!(handle.join().await.unwrap_err(), ErrorKind::AcceptFailed);

        match next(&mut rx).await {
            LinkEvent::EstablishFailed { role, error } => {
                assert_eq!(role, Role::Listening);
                assert!(error.is_cancelled());
            }
            other => panic!("unexpected {:?}", other),
        }
        // Endpoint released: the same service can be bound again.
        assert!(transport.listen(service).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_interrupts_parked_connect() {
        let net = MemoryNetwork::new();
        net.add_black_hole("void");
        let (tx, mut rx) = event_channel();
        let handle = ConnectionEstablisher::new(
            Arc::new(net.endpoint("b")),
            ConnectionAttempt::dial(PeerIdentity::new("void", ServiceId::random())),
            tx,
        )
        .start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        handle.cancel();
        assert_eq!(handle.join().await.unwrap_err(), ErrorKind::ConnectFailed);
        match next(&mut rx).await {
            LinkEvent::EstablishFailed { role, error } => {
                assert_eq!(role, Role::Dialing);
                assert!(error.is_cancelled());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(net.open_streams(), 0);
    }

    #[tokio::test]
    async fn dial_to_nothing_fails_without_session() {
        let net = MemoryNetwork::new();
        let (tx, mut rx) = event_channel();
        let handle = ConnectionEstablisher::new(
            Arc::new(net.endpoint("b")),
            ConnectionAttempt::dial(PeerIdentity::new("nobody", ServiceId::random())),
            tx,
        )
        .start();
        assert_eq!(handle.join().await.unwrap_err(), ErrorKind::ConnectFailed);
        match next(&mut rx).await {
            LinkEvent::EstablishFailed { role, error } => {
                assert_eq!(role, Role::Dialing);
                assert!(!error.is_cancelled());
                assert_eq!(error.kind(), ErrorKind::ConnectFailed);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(net.open_streams(), 0);
    }

    #[tokio::test]
    async fn bind_conflict_is_bind_failed() {
        let net = MemoryNetwork::new();
        let service = ServiceId::random();
        let _taken = net.endpoint("a").listen(service).await.unwrap();
        let (tx, mut rx) = event_channel();
        let handle = ConnectionEstablisher::new(
            Arc::new(net.endpoint("a")),
            ConnectionAttempt::listen(service),
            tx,
        )
        .start();
        assert_eq!(handle.bound_address().await, None);
        assert_eq!(handle.state(), SessionState::Closed);
        assert_eq!(handle.join().await.unwrap_err(), ErrorKind::BindFailed);
        assert!(matches!(
            next(&mut rx).await,
            LinkEvent::EstablishFailed { role: Role::Listening, .. }
        ));
    }

    #[tokio::test]
    async fn bound_address_cleared_once_endpoint_closes() {
        let net = MemoryNetwork::new();
        let service = ServiceId::random();
        let (tx, _rx) = event_channel();
        let listener = ConnectionEstablisher::new(
            Arc::new(net.endpoint("a")),
            ConnectionAttempt::listen(service),
            tx,
        )
        .start();
        assert!(listener.bound_address().await.is_some());
        listener.cancel();
        while !listener.is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(listener.bound_address().await, None);
    }

    #[tokio::test]
    async fn cancel_after_success_is_harmless() {
        let net = MemoryNetwork::new();
        let service = ServiceId::random();
        let (tx, _rx) = event_channel();
        let listener = ConnectionEstablisher::new(
            Arc::new(net.endpoint("a")),
            ConnectionAttempt::listen(service),
            tx.clone(),
        )
        .start();
        listener.bound_address().await.unwrap();
        let dialer = ConnectionEstablisher::new(
            Arc::new(net.endpoint("b")),
            ConnectionAttempt::dial(PeerIdentity::new("a", service)),
            tx,
        )
        .start();
        let dialed = dialer.join().await.unwrap();
        while !listener.is_finished() {
            tokio::task::yield_now().await;
        }
        listener.cancel();
        let accepted = listener.join().await.unwrap();
        assert!(accepted.is_open());
        dialed.close().await;
        accepted.closed().await;
    }
}
