use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (CHATMESH_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("CHATMESH_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("chatmesh_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = chatmesh_server::config::NodeConfig::parse();
    tracing::info!(server = %config.server_id, "Starting replication node on {}", config.listen_addr);
    let peers = config.bootstrap_peers();
    if !peers.is_empty() {
        let list: Vec<String> = peers.iter().map(ToString::to_string).collect();
        tracing::info!("Bootstrap peers: {}", list.join(", "));
    }

    let node = chatmesh_server::node::Node::new(config)?;
    node.run().await
}
