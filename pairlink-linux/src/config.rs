//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::PathBuf;

use pairlink_core::{ServiceId, SessionConfig, DEFAULT_READ_BUFFER_SIZE, DEFAULT_SERVICE_NAME};
use serde::Deserialize;

/// Host configuration. File: ~/.config/pairlink/config.toml or /etc/pairlink/config.toml.
/// Env overrides: PAIRLINK_SERVICE_ID, PAIRLINK_LISTEN_ADDR, PAIRLINK_DISCOVERY_PORT,
/// PAIRLINK_READ_BUFFER_SIZE.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Service id both peers must agree on.
    #[serde(default)]
    pub service_id: ServiceId,
    /// Advertised in discovery beacons.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Address the listener binds (default 0.0.0.0:45679).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Discovery UDP port (default 45678).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_string()
}
fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 45679))
}
fn default_discovery_port() -> u16 {
    45678
}
fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_id: ServiceId::default(),
            service_name: default_service_name(),
            listen_addr: default_listen_addr(),
            discovery_port: default_discovery_port(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl Config {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default().with_read_buffer_size(self.read_buffer_size)
    }

    /// Apply overrides from `var` (the process environment in `load`). Values that do not
    /// parse are ignored with a warning.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("PAIRLINK_SERVICE_ID") {
            match s.parse() {
                Ok(id) => self.service_id = id,
                Err(e) => tracing::warn!(value = %s, error = %e, "ignoring PAIRLINK_SERVICE_ID"),
            }
        }
        if let Some(s) = var("PAIRLINK_LISTEN_ADDR") {
            match s.parse() {
                Ok(addr) => self.listen_addr = addr,
                Err(e) => tracing::warn!(value = %s, error = %e, "ignoring PAIRLINK_LISTEN_ADDR"),
            }
        }
        if let Some(s) = var("PAIRLINK_DISCOVERY_PORT") {
            match s.parse() {
                Ok(p) => self.discovery_port = p,
                Err(e) => tracing::warn!(value = %s, error = %e, "ignoring PAIRLINK_DISCOVERY_PORT"),
            }
        }
        if let Some(s) = var("PAIRLINK_READ_BUFFER_SIZE") {
            match s.parse() {
                Ok(n) => self.read_buffer_size = n,
                Err(e) => tracing::warn!(value = %s, error = %e, "ignoring PAIRLINK_READ_BUFFER_SIZE"),
            }
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|name| std::env::var(name).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/pairlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/pairlink/config.toml"));
    out
}

/// First existing file wins; an unreadable or invalid one falls back to defaults.
fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read config file");
            return None;
        }
    };
    match toml::from_str::<Config>(&text) {
        Ok(c) => {
            tracing::debug!(path = %path.display(), "loaded config file");
            Some(c)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
            None
        }
    }
}
