//! Node configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::delivery::DeliveryPolicy;
use crate::error::ConfigError;

#[derive(Parser, Debug, Clone)]
#[command(name = "chatmesh-server", about = "Chat server replication node")]
pub struct NodeConfig {
    /// Logical server name announced to peers (may collide across nodes)
    #[arg(long, env = "CHATMESH_SERVER_ID", default_value = "node")]
    pub server_id: String,

    /// Address to listen on for peer links
    #[arg(long, env = "CHATMESH_LISTEN_ADDR", default_value = "0.0.0.0:5100")]
    pub listen_addr: String,

    /// Bootstrap peers, comma-separated host:port list
    #[arg(long, env = "CHATMESH_PEERS", default_value = "")]
    pub peers: String,

    /// SQLite database path. In-memory when unset.
    #[arg(long, env = "CHATMESH_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Timeout for outbound peer connects
    #[arg(long, default_value = "3")]
    pub connect_timeout_secs: u64,

    /// Interval of the pending-message retry sweep
    #[arg(long, default_value = "10")]
    pub retry_interval_secs: u64,

    /// Age after which an unacknowledged message is resent
    #[arg(long, default_value = "30")]
    pub ack_timeout_secs: u64,

    /// Resends before a message is dropped as a permanent failure
    #[arg(long, default_value = "3")]
    pub max_retries: u32,

    /// Largest binary column (profile photo) accepted when merging snapshots
    #[arg(long, default_value = "1048576")]
    pub max_blob_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_id: "node".to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
            peers: String::new(),
            db_path: None,
            connect_timeout_secs: 3,
            retry_interval_secs: 10,
            ack_timeout_secs: 30,
            max_retries: 3,
            max_blob_bytes: 1024 * 1024,
        }
    }
}

impl NodeConfig {
    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            sweep_interval: Duration::from_secs(self.retry_interval_secs.max(1)),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            max_retries: self.max_retries,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Port of the configured listen address, if it parses.
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map(|a| a.port())
            .ok()
            .or_else(|| split_endpoint(&self.listen_addr).ok().map(|(_, p)| p))
    }

    /// Bootstrap peers with malformed and self-referencing entries removed.
    pub fn bootstrap_peers(&self) -> Vec<PeerAddress> {
        parse_peers(&self.peers, &self.listen_addr)
    }
}

/// A `host:port` peer endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl std::str::FromStr for PeerAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = split_endpoint(s)?;
        Ok(Self { host, port })
    }
}

fn split_endpoint(raw: &str) -> Result<(String, u16), ConfigError> {
    let raw = raw.trim();
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::MalformedEndpoint(raw.to_string()))?;
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    let port = port.trim();
    if host.is_empty() || port.is_empty() {
        return Err(ConfigError::MalformedEndpoint(raw.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::InvalidPort(raw.to_string()))?;
    if port == 0 {
        return Err(ConfigError::InvalidPort(raw.to_string()));
    }
    Ok((host.to_string(), port))
}

/// Parse a comma-separated bootstrap list.
///
/// Malformed entries are logged and skipped. An entry pointing back at this
/// node's own listener (loopback or the configured host, same port) is
/// dropped silently.
pub fn parse_peers(raw: &str, listen_addr: &str) -> Vec<PeerAddress> {
    let own = split_endpoint(listen_addr).ok();
    let mut peers = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let addr = match entry.parse::<PeerAddress>() {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(entry, "Ignoring bootstrap peer: {e}");
                continue;
            }
        };
        if let Some((own_host, own_port)) = &own {
            let loopback = matches!(addr.host.as_str(), "localhost" | "127.0.0.1" | "::1");
            if addr.port == *own_port && (loopback || addr.host.eq_ignore_ascii_case(own_host)) {
                tracing::debug!(entry, "Skipping bootstrap entry for this node");
                continue;
            }
        }
        if !peers.contains(&addr) {
            peers.push(addr);
        }
    }
    peers
}
