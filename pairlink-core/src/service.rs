//! Connection service: at most one pending listener and one pending dialer per host.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::SessionConfig;
use crate::discovery::{Discovery, NoDiscovery};
use crate::establisher::{wait_bound, ConnectionAttempt, ConnectionEstablisher, EstablishHandle};
use crate::events::EventSender;
use crate::identity::{PeerAddress, PeerIdentity, ServiceId};
use crate::transport::Transport;

/// Starts and supersedes establishment attempts. Sessions they produce are handed to the
/// consumer through `Established` and are not tracked here.
pub struct ConnectionService<T: Transport> {
    transport: Arc<T>,
    config: SessionConfig,
    discovery: Arc<dyn Discovery>,
    events: EventSender,
    listener: Mutex<Option<EstablishHandle>>,
    dialer: Mutex<Option<EstablishHandle>>,
}

impl<T: Transport> ConnectionService<T> {
    pub fn new(transport: T, events: EventSender) -> Self {
        Self {
            transport: Arc::new(transport),
            config: SessionConfig::default(),
            discovery: Arc::new(NoDiscovery),
            events,
            listener: Mutex::new(None),
            dialer: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Enter the listening role. An in-flight dialer is cancelled and awaited first, then
    /// any previous listener is retired so its endpoint is closed before the new bind.
    pub async fn start_listening(&self, service_id: ServiceId) {
        let mut listener = self.listener.lock().await;
        retire(self.dialer.lock().await.take()).await;
        retire(listener.take()).await;

        tracing::debug!(service = %service_id, "starting listener");
        let handle = self
            .establisher(ConnectionAttempt::listen(service_id))
            .start();
        *listener = Some(handle);
    }

    /// Enter the dialing role toward `peer`, superseding any previous dial attempt.
    /// A pending listener keeps running.
    pub async fn start_dialing(&self, peer: PeerIdentity) {
        let mut dialer = self.dialer.lock().await;
        retire(dialer.take()).await;

        tracing::debug!(peer = %peer, "starting dialer");
        let handle = self.establisher(ConnectionAttempt::dial(peer)).start();
        *dialer = Some(handle);
    }

    /// Cancel both pending attempts and wait for them to stop, so no endpoint stays open.
    /// Established sessions are unaffected.
    pub async fn cancel(&self) {
        let mut listener = self.listener.lock().await;
        retire(self.dialer.lock().await.take()).await;
        retire(listener.take()).await;
    }

    /// Address of the current listener while its endpoint is open. `None` when not
    /// listening, after `cancel`, after the bind failed, or once the one inbound
    /// connection was accepted.
    pub async fn listening_address(&self) -> Option<PeerAddress> {
        let bound = self.listener.lock().await.as_ref()?.bound_watch();
        wait_bound(bound).await
    }

    fn establisher(&self, attempt: ConnectionAttempt) -> ConnectionEstablisher<T> {
        ConnectionEstablisher::new(self.transport.clone(), attempt, self.events.clone())
            .with_config(self.config.clone())
            .with_discovery(self.discovery.clone())
    }
}

/// Cancel a superseded attempt and wait for its task to finish. A session it already
/// produced belongs to the consumer and is left open.
async fn retire(handle: Option<EstablishHandle>) {
    let Some(handle) = handle else {
        return;
    };
    let role = handle.role();
    handle.cancel();
    match handle.join().await {
        Ok(session) => {
            tracing::debug!(role = %role, session = %session.id(), "superseded attempt had already connected")
        }
        Err(kind) => tracing::debug!(role = %role, error = %kind, "superseded attempt stopped"),
    }
}
