//! LAN discovery: a listening host multicasts beacons; a dialing host scans for one.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use pairlink_core::wire::{decode_frame, encode_frame};
use pairlink_core::{Discovery, Message, ServiceId, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::watch;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);

/// Beacon and scan loops sharing one stop switch. `stop_discovery` ends both.
pub struct LanDiscovery {
    port: u16,
    stop: watch::Sender<bool>,
}

impl LanDiscovery {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            stop: watch::channel(false).0,
        }
    }

    /// Beacon `service_id` and the transport port until discovery is stopped.
    pub fn advertise(&self, service_id: ServiceId, name: String, listen_port: u16) {
        let beacon = Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            service_id,
            listen_port,
            name,
        };
        let port = self.port;
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = stopped(&mut stop) => {}
                result = beacon_loop(beacon, port) => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "beacon loop stopped");
                    }
                }
            }
        });
    }

    /// Wait for a beacon advertising `service_id`. Returns the advertised transport address,
    /// or `None` once discovery is stopped.
    pub async fn scan(&self, service_id: ServiceId) -> io::Result<Option<SocketAddr>> {
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return Ok(None);
        }
        let socket = multicast_socket(self.port)?;
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                _ = stopped(&mut stop) => return Ok(None),
                received = socket.recv_from(&mut buf) => {
                    let (n, from) = received?;
                    if let Some(addr) = match_beacon(&buf[..n], from, service_id) {
                        tracing::info!(peer = %addr, "found peer");
                        return Ok(Some(addr));
                    }
                }
            }
        }
    }
}

impl Discovery for LanDiscovery {
    fn stop_discovery(&self) {
        if !self.stop.send_replace(true) {
            tracing::debug!("discovery stopped");
        }
    }
}

/// Also resolves when the `LanDiscovery` is dropped.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

/// Transport address advertised by `datagram`, if it is a current-version beacon for
/// `service_id`.
fn match_beacon(datagram: &[u8], from: SocketAddr, service_id: ServiceId) -> Option<SocketAddr> {
    match decode_frame(datagram) {
        Ok((
            Message::Beacon {
                protocol_version,
                service_id: advertised,
                listen_port,
                name,
            },
            _,
        )) if protocol_version == PROTOCOL_VERSION && advertised == service_id => {
            tracing::debug!(from = %from, name = %name, "beacon");
            Some(SocketAddr::new(from.ip(), listen_port))
        }
        _ => None,
    }
}

fn multicast_socket(port: u16) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(beacon: Message, port: u16) -> io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_multicast_ttl_v4(1)?;
    let frame = encode_frame(&beacon).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let dest = SocketAddr::from((MULTICAST_GROUP, port));
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            tracing::debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}
