//! Pairlink terminal host: TCP transport, LAN discovery, line chat with one peer.

mod chat;
mod cli;
mod config;
mod discovery;
mod shutdown;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use pairlink_core::{
    event_channel, ConnectionService, Discovery, LinkEvent, PeerAddress, PeerIdentity,
    TcpTransport,
};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::discovery::LanDiscovery;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    // Logs go to stderr so they do not mix with chat text on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("pairlink v{}", env!("CARGO_PKG_VERSION"));

    let mut cfg = config::load();
    if let Some(id) = cli.service {
        cfg.service_id = id;
    }
    if let Some(addr) = cli.listen_addr {
        cfg.listen_addr = addr;
    }

    let discovery = Arc::new(LanDiscovery::new(cfg.discovery_port));
    let (events_tx, mut events) = event_channel();
    let service = ConnectionService::new(TcpTransport::new(cfg.listen_addr), events_tx)
        .with_config(cfg.session_config())
        .with_discovery(discovery.clone());

    let shutdown = shutdown::wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    match cli.command {
        Command::Listen => {
            service.start_listening(cfg.service_id).await;
            if let Some(addr) = service.listening_address().await {
                println!("waiting for a peer on {} (service {})", addr, cfg.service_id);
                let port = addr
                    .as_str()
                    .parse::<SocketAddr>()
                    .map(|a| a.port())
                    .unwrap_or(cfg.listen_addr.port());
                discovery.advertise(cfg.service_id, cfg.service_name.clone(), port);
            }
        }
        Command::Dial { peer } => {
            let address = match peer {
                Some(peer) => PeerAddress::new(peer),
                None => {
                    println!("scanning for a peer (service {})", cfg.service_id);
                    let found = tokio::select! {
                        _ = &mut shutdown => return Ok(()),
                        found = discovery.scan(cfg.service_id) => found.context("LAN discovery failed")?,
                    };
                    match found {
                        Some(addr) => PeerAddress::from(addr),
                        None => bail!("discovery stopped before a peer was found"),
                    }
                }
            };
            println!("connecting to {}", address);
            service
                .start_dialing(PeerIdentity::new(address, cfg.service_id))
                .await;
        }
    }

    let session = loop {
        tokio::select! {
            _ = &mut shutdown => {
                service.cancel().await;
                return Ok(());
            }
            event = events.recv() => match event {
                Some(LinkEvent::Established { session, .. }) => break session,
                Some(LinkEvent::EstablishFailed { role, error }) => {
                    bail!("{} failed: {}", role, error);
                }
                Some(_) => {}
                None => bail!("event channel closed"),
            },
        }
    };
    discovery.stop_discovery();
    println!("connected ({}), type to chat", session.role());

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    chat::run(session, &mut events, stdin, &mut stdout, shutdown).await
}
