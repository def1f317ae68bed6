//! Mesh routing: loop-safe flooding, identity collisions, connect
//! validation and bounded retry.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use serde_json::json;

use chatmesh_server::config::NodeConfig;
use chatmesh_server::diagnostics::{self, ClusterCommand};
use chatmesh_server::error::LinkError;
use chatmesh_server::mesh::PeerStatusListener;
use chatmesh_server::metrics;
use chatmesh_server::presence::UserKey;

use common::*;

#[tokio::test]
async fn triangle_delivers_broadcast_once_per_node() {
    let (a, a_addr) = start_node("node-a").await;
    let (b, b_addr) = start_node("node-b").await;
    let (c, c_addr) = start_node("node-c").await;
    link(&a, &b, b_addr).await;
    link(&b, &c, c_addr).await;
    link(&c, &a, a_addr).await;
    for node in [&a, &b, &c] {
        assert_eq!(node.mesh().connected_peer_ids().len(), 2);
    }

    let (_sa, mut rx_a) = a.open_session(None);
    let (_sb, mut rx_b) = b.open_session(None);
    let (_sc, mut rx_c) = c.open_session(None);

    let local = a.mesh().broadcast_everywhere(json!({"event": "ANNOUNCEMENT", "text": "maintenance at noon"}));
    assert_eq!(local, 1);

    let is_announcement = |p: &serde_json::Value| p["event"] == "ANNOUNCEMENT";
    wait_for_payload(&mut rx_b, is_announcement, "broadcast on B").await;
    wait_for_payload(&mut rx_c, is_announcement, "broadcast on C").await;
    assert_eq!(count_payloads(&mut rx_b, is_announcement).await, 0);
    assert_eq!(count_payloads(&mut rx_c, is_announcement).await, 0);
    assert_eq!(count_payloads(&mut rx_a, is_announcement).await, 1);

    for node in [&a, &b, &c] {
        node.stop().await;
    }
}

#[tokio::test]
async fn triangle_session_presence_converges_through_relay() {
    let (a, _) = start_node("node-a").await;
    let (b, b_addr) = start_node("node-b").await;
    let (c, _) = start_node("node-c").await;
    c.register_user("carol", "carol@example.com", None).unwrap();
    link(&a, &b, b_addr).await;
    // C only knows B; A learns about C through B.
    link(&c, &b, b_addr).await;

    let (_carol, _rx) = logged_in(&c, "carol");
    let key = UserKey { user_id: None, username: Some("carol".into()), email: None };
    wait_until("A sees carol on node-c", || {
        a.presence().plan_user_send(&key).remote_servers == vec!["node-c".to_string()]
    })
    .await;
    wait_until("carol replicated to A", || a.synchronizer().local_user_id(None, Some("carol")).is_some()).await;

    // A DM from A to C crosses B and the ack comes back the same way.
    a.register_user("alice", "alice@example.com", None).unwrap();
    let (alice, _alice_rx) = logged_in(&a, "alice");
    a.send_direct(&alice, &key, "hi carol").unwrap();
    let mesh = a.mesh();
    wait_until("ack across two hops", || mesh.metrics().get(metrics::CONFIRMED) == 1).await;

    for node in [&a, &b, &c] {
        node.stop().await;
    }
}

#[tokio::test]
async fn colliding_server_ids_get_distinct_identities() {
    let (hub, hub_addr) = start_node("alpha").await;
    let (first, _) = start_node("beta").await;
    let (second, _) = start_node("beta").await;
    let (twin, _) = start_node("alpha").await;

    link(&first, &hub, hub_addr).await;
    link(&second, &hub, hub_addr).await;
    link(&twin, &hub, hub_addr).await;

    let ids: BTreeSet<String> = hub.mesh().connected_peer_ids().into_iter().collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.contains("beta"));
    assert!(ids.contains("beta-2"));
    assert!(ids.contains("alpha@127.0.0.1"));
    assert!(!ids.contains("alpha"));

    let directory = hub.mesh().directory();
    let beta = directory.lookup("beta").unwrap();
    let beta2 = directory.lookup("beta-2").unwrap();
    assert_ne!(beta.generation(), beta2.generation());
    assert_eq!(beta.instance_id().as_deref(), Some(first.mesh().instance_id()));
    assert_eq!(beta2.instance_id().as_deref(), Some(second.mesh().instance_id()));
    // The instance id always addresses the exact link.
    let by_instance = directory.lookup(second.mesh().instance_id()).unwrap();
    assert_eq!(by_instance.generation(), beta2.generation());

    // Presence announced by the second "beta" lands under its resolved id.
    second.register_user("bob", "bob@example.com", None).unwrap();
    let (_bob, _rx) = logged_in(&second, "bob");
    wait_until("bob listed under beta-2", || !hub.presence().remote_sessions("beta-2").is_empty()).await;
    assert!(hub.presence().remote_sessions("beta").is_empty());

    for node in [&hub, &first, &second, &twin] {
        node.stop().await;
    }
}

#[tokio::test]
async fn connect_validation() {
    let (node, addr) = start_node("solo").await;
    let mesh = node.mesh();

    assert!(matches!(mesh.connect_to_peer("  ", 5100).await, Err(LinkError::InvalidAddress(_))));
    assert!(matches!(mesh.connect_to_peer("127.0.0.1", 0).await, Err(LinkError::InvalidAddress(_))));
    assert!(matches!(
        mesh.connect_to_peer("localhost", addr.port()).await,
        Err(LinkError::SelfConnection(_))
    ));
    assert!(matches!(
        mesh.connect_to_peer("127.0.0.1", addr.port()).await,
        Err(LinkError::SelfConnection(_))
    ));

    node.stop().await;
    assert!(matches!(mesh.connect_to_peer("127.0.0.1", 5100).await, Err(LinkError::NotRunning)));
}

#[tokio::test]
async fn duplicate_dial_keeps_one_link() {
    let (a, a_addr) = start_node("node-a").await;
    let (b, b_addr) = start_node("node-b").await;
    link(&a, &b, b_addr).await;
    b.connect_to_peer("127.0.0.1", a_addr.port()).await.unwrap();

    tokio::time::sleep(QUIET).await;
    assert_eq!(a.mesh().connected_peer_ids(), vec!["node-b".to_string()]);
    assert_eq!(b.mesh().connected_peer_ids(), vec!["node-a".to_string()]);

    // The surviving link still carries traffic both ways.
    let (_s, mut rx) = b.open_session(None);
    a.mesh().broadcast(json!({"event": "PING"}));
    wait_for_payload(&mut rx, |p| p["event"] == "PING", "broadcast over surviving link").await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn unreachable_target_retries_then_fails_once() {
    let (node, _) = start_with(NodeConfig {
        ack_timeout_secs: 1,
        max_retries: 2,
        ..config("lonely")
    })
    .await;
    let mesh = node.mesh();
    let key = UserKey { user_id: Some(9), username: Some("ghost".into()), email: None };
    let id = mesh.forward_to_user("nowhere", &key, json!({"content": "anyone?"})).unwrap();

    let start = Instant::now();
    mesh.run_sweep(start);
    assert_eq!(mesh.pending_messages().len(), 1, "not expired yet");

    mesh.run_sweep(start + Duration::from_secs(2));
    mesh.run_sweep(start + Duration::from_secs(4));
    let pending = mesh.pending_messages();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_id, id);
    assert_eq!(pending[0].retry_count, 2);
    assert_eq!(mesh.metrics().get(metrics::RETRIED), 2);

    let report = diagnostics::execute(mesh, ClusterCommand::Pending);
    assert_eq!(report[0], "Pending messages: 1");
    assert!(report[1].contains(&id));
    assert!(report[1].contains("retries=2"));

    mesh.run_sweep(start + Duration::from_secs(6));
    assert!(mesh.pending_messages().is_empty());
    assert_eq!(mesh.metrics().get(metrics::PERMANENT_FAILURE), 1);

    mesh.run_sweep(start + Duration::from_secs(8));
    assert_eq!(mesh.metrics().get(metrics::PERMANENT_FAILURE), 1);
    assert_eq!(mesh.metrics().get(metrics::RETRIED), 2);

    node.stop().await;
}

#[tokio::test]
async fn replication_status_shows_in_peer_report() {
    let (a, _) = start_node("node-a").await;
    let (b, b_addr) = start_node("node-b").await;
    link(&a, &b, b_addr).await;

    let reply = diagnostics::execute(b.mesh(), ClusterCommand::Status);
    assert_eq!(reply, vec!["Replication status sent to 1 peer(s)".to_string()]);
    wait_until("status recorded on A", || a.mesh().replication_statuses().contains_key("node-b")).await;

    let report = diagnostics::report(a.mesh());
    assert!(report.contains("Connected peers: 1"));
    assert!(report.contains("  node-b"));
    assert!(report.contains("node-b connected (peers=1, pending=0)"));

    b.stop().await;
    wait_until("A notices B is gone", || a.mesh().connected_peer_ids().is_empty()).await;
    let servers = diagnostics::execute(a.mesh(), ClusterCommand::Servers);
    assert!(servers.iter().any(|l| l.starts_with("  node-b unreachable")));

    a.stop().await;
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl PeerStatusListener for Recorder {
    fn on_peer_connected(&self, server_id: &str) {
        self.seen.lock().push(format!("up {server_id}"));
    }

    fn on_peer_disconnected(&self, server_id: &str) {
        self.seen.lock().push(format!("down {server_id}"));
    }
}

#[tokio::test]
async fn status_listener_sees_connect_and_disconnect() {
    let (a, _) = start_node("node-a").await;
    let (b, b_addr) = start_node("node-b").await;
    let recorder = Arc::new(Recorder::default());
    a.mesh().add_status_listener(recorder.clone());

    link(&a, &b, b_addr).await;
    wait_until("connect callback", || recorder.seen.lock().len() == 1).await;

    b.stop().await;
    wait_until("disconnect callback", || recorder.seen.lock().len() == 2).await;
    assert_eq!(*recorder.seen.lock(), vec!["up node-b".to_string(), "down node-b".to_string()]);

    a.stop().await;
}
