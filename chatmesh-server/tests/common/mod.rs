//! Shared helpers for the multi-node tests. Every node listens on an
//! ephemeral loopback port with an in-memory database.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use chatmesh_server::config::NodeConfig;
use chatmesh_server::node::Node;

/// How long to wait for mesh state to converge.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period when asserting that something does NOT happen.
pub const QUIET: Duration = Duration::from_millis(500);

pub fn config(server_id: &str) -> NodeConfig {
    NodeConfig {
        server_id: server_id.to_string(),
        listen_addr: "127.0.0.1:0".to_string(),
        // Tests drive the retry sweep by hand.
        retry_interval_secs: 3600,
        ..Default::default()
    }
}

pub async fn start_node(server_id: &str) -> (Node, SocketAddr) {
    start_with(config(server_id)).await
}

pub async fn start_with(config: NodeConfig) -> (Node, SocketAddr) {
    let node = Node::new(config).expect("node");
    let addr = node.start().await.expect("start");
    (node, addr)
}

/// Dial `to` from `from` and wait until both ends list each other.
pub async fn link(from: &Node, to: &Node, to_addr: SocketAddr) {
    let before_from = from.mesh().connected_peer_ids().len();
    let before_to = to.mesh().connected_peer_ids().len();
    from.connect_to_peer("127.0.0.1", to_addr.port()).await.expect("connect");
    wait_until("link established on both ends", || {
        from.mesh().connected_peer_ids().len() > before_from
            && to.mesh().connected_peer_ids().len() > before_to
    })
    .await;
}

/// Poll `check` until it holds or [`TIMEOUT`] passes.
pub async fn wait_until<F: FnMut() -> bool>(desc: &str, mut check: F) {
    let result = timeout(TIMEOUT, async {
        loop {
            if check() {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    result.unwrap_or_else(|_| panic!("Timeout ({TIMEOUT:?}) waiting for: {desc}"));
}

/// Wait for a pushed client payload matching `predicate`, skipping others.
pub async fn wait_for_payload<F: Fn(&Value) -> bool>(
    rx: &mut mpsc::UnboundedReceiver<String>,
    predicate: F,
    desc: &str,
) -> Value {
    let result = timeout(TIMEOUT, async {
        loop {
            match rx.recv().await {
                Some(line) => {
                    let frame: Value = serde_json::from_str(&line).expect("client frame is JSON");
                    let payload = frame["payload"].clone();
                    if predicate(&payload) {
                        return payload;
                    }
                }
                None => panic!("Client queue closed while waiting for: {desc}"),
            }
        }
    })
    .await;
    result.unwrap_or_else(|_| panic!("Timeout ({TIMEOUT:?}) waiting for: {desc}"))
}

/// Count payloads matching `predicate` that arrive within [`QUIET`].
pub async fn count_payloads<F: Fn(&Value) -> bool>(
    rx: &mut mpsc::UnboundedReceiver<String>,
    predicate: F,
) -> usize {
    let mut count = 0;
    let _ = timeout(QUIET, async {
        while let Some(line) = rx.recv().await {
            let frame: Value = serde_json::from_str(&line).expect("client frame is JSON");
            if predicate(&frame["payload"]) {
                count += 1;
            }
        }
    })
    .await;
    count
}

/// Register a user and open a session logged in as them.
pub fn logged_in(node: &Node, username: &str) -> (String, mpsc::UnboundedReceiver<String>) {
    let (session, rx) = node.open_session(Some("127.0.0.1"));
    node.login(&session, username).expect("login");
    (session, rx)
}
