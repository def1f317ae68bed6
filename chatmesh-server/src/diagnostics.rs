//! Operator-facing cluster commands.
//!
//! `CLUSTER PEERS|METRICS|PENDING|SERVERS|STATUS|REPORT`. Everything but
//! STATUS is read-only; STATUS floods this node's replication status to the
//! mesh so every node's report reflects it.

use std::str::FromStr;

use crate::mesh::PeerManager;

pub const USAGE: &str = "Usage: CLUSTER PEERS|METRICS|PENDING|SERVERS|STATUS|REPORT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterCommand {
    Peers,
    Metrics,
    Pending,
    Servers,
    Status,
    Report,
}

impl FromStr for ClusterCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PEERS" => Ok(ClusterCommand::Peers),
            "METRICS" => Ok(ClusterCommand::Metrics),
            "PENDING" => Ok(ClusterCommand::Pending),
            "SERVERS" => Ok(ClusterCommand::Servers),
            "STATUS" => Ok(ClusterCommand::Status),
            "REPORT" | "" => Ok(ClusterCommand::Report),
            other => Err(format!("Unknown CLUSTER subcommand {other}. {USAGE}")),
        }
    }
}

/// Run a command and return the reply lines.
pub fn execute(manager: &PeerManager, command: ClusterCommand) -> Vec<String> {
    match command {
        ClusterCommand::Peers => peer_lines(manager),
        ClusterCommand::Metrics => metric_lines(manager),
        ClusterCommand::Pending => pending_lines(manager),
        ClusterCommand::Servers => server_lines(manager),
        ClusterCommand::Status => {
            let sent = manager.broadcast_replication_status();
            tracing::info!(sent, "Replication status broadcast requested");
            vec![format!("Replication status sent to {sent} peer(s)")]
        }
        ClusterCommand::Report => report(manager).lines().map(str::to_string).collect(),
    }
}

/// Full text report: identity, peers, metrics, pending messages, servers.
pub fn report(manager: &PeerManager) -> String {
    let mut out = vec![format!(
        "Server {} (instance {}){}",
        manager.server_id(),
        manager.instance_id(),
        manager.local_addr().map(|a| format!(" listening on {a}")).unwrap_or_default()
    )];
    for section in [
        peer_lines(manager),
        metric_lines(manager),
        pending_lines(manager),
        server_lines(manager),
    ] {
        out.extend(section);
    }
    out.join("\n")
}

fn peer_lines(manager: &PeerManager) -> Vec<String> {
    let ids = manager.connected_peer_ids();
    let mut lines = vec![format!("Connected peers: {}", ids.len())];
    for id in ids {
        let aliases = manager.directory().aliases_of(&id);
        if aliases.is_empty() {
            lines.push(format!("  {id}"));
        } else {
            lines.push(format!("  {id} (aliases: {})", aliases.join(", ")));
        }
    }
    lines
}

fn metric_lines(manager: &PeerManager) -> Vec<String> {
    let counters = manager.metrics().snapshot();
    if counters.is_empty() {
        return vec!["Metrics: none".to_string()];
    }
    let mut lines = vec!["Metrics:".to_string()];
    lines.extend(counters.iter().map(|(name, value)| format!("  {name}={value}")));
    lines
}

fn pending_lines(manager: &PeerManager) -> Vec<String> {
    let pending = manager.pending_messages();
    let mut lines = vec![format!("Pending messages: {}", pending.len())];
    for p in pending {
        lines.push(format!(
            "  {} {} -> {} age={}s retries={}",
            p.message_id,
            p.kind,
            p.target_server,
            p.age().num_seconds().max(0),
            p.retry_count
        ));
    }
    lines
}

fn server_lines(manager: &PeerManager) -> Vec<String> {
    let known = manager.presence().known_servers();
    let statuses = manager.replication_statuses();
    let mut lines = vec![format!("Known servers: {}", known.len())];
    for server in known {
        let state = if manager.directory().is_connected(&server) { "connected" } else { "unreachable" };
        match statuses.get(&server) {
            Some(status) => lines.push(format!(
                "  {server} {state} (peers={}, pending={})",
                status.connected_peers.len(),
                status.pending_count
            )),
            None => lines.push(format!("  {server} {state}")),
        }
    }
    lines
}
