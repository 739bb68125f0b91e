//! Discovery boundary. Peer discovery itself is the host's job; the core only asks it to stop.

/// Host-side peer discovery. Dialing calls `stop_discovery` before connecting because an
/// active scan slows connection setup.
pub trait Discovery: Send + Sync {
    fn stop_discovery(&self);
}

/// For hosts without a discovery scan.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiscovery;

impl Discovery for NoDiscovery {
    fn stop_discovery(&self) {}
}
