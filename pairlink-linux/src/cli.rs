//! Command-line argument parsing.

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use pairlink_core::ServiceId;

/// Pairlink terminal chat.
#[derive(Parser, Debug, Clone)]
#[command(name = "pairlink")]
#[command(about = "Pair with one peer and chat over a duplex stream")]
#[command(version)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Service id to listen under or dial (overrides config).
    #[arg(long, global = true)]
    pub service: Option<ServiceId>,

    /// Address the listener binds (overrides config).
    #[arg(long, global = true)]
    pub listen_addr: Option<SocketAddr>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Wait for one peer to dial in.
    Listen,
    /// Dial a peer (`host:port`); without one, scan the LAN for a listener.
    Dial { peer: Option<String> },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
