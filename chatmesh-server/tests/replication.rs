//! Two-node replication: snapshot merge on connect, incremental updates,
//! presence, and forwarded direct messages.

mod common;

use chatmesh_server::metrics;
use chatmesh_server::presence::UserKey;

use common::*;

#[tokio::test]
async fn channel_reaches_empty_peer_once() {
    let (a, _a_addr) = start_node("node-a").await;
    let (b, b_addr) = start_node("node-b").await;

    a.register_user("alice", "alice@example.com", None).unwrap();
    let (alice, _rx) = logged_in(&a, "alice");
    for i in 0..9 {
        a.create_channel(&alice, &format!("filler-{i}"), false).unwrap();
    }
    let general = a.create_channel(&alice, "general", false).unwrap();
    assert_eq!(general.id, 10);

    link(&a, &b, b_addr).await;

    let sync = b.synchronizer();
    wait_until("general replicated to B", || sync.channel_by_uuid(&general.uuid).is_some()).await;

    let channels = sync.with_db(|db| db.all_channels()).unwrap();
    assert_eq!(channels.iter().filter(|c| c.uuid == general.uuid).count(), 1);
    let local = sync.channel_by_uuid(&general.uuid).unwrap();
    assert_eq!(local.name, "general");

    let alice_on_b = sync.local_user_id(Some("alice@example.com"), None).unwrap();
    wait_until("membership replicated to B", || {
        sync.with_db(|db| db.channel_members(local.id)).is_some_and(|m| !m.is_empty())
    })
    .await;
    let members = sync.with_db(|db| db.channel_members(local.id)).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].id, alice_on_b);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn direct_message_resolves_recipient_by_email() {
    let (a, _a_addr) = start_node("node-a").await;
    let (b, b_addr) = start_node("node-b").await;

    for i in 0..41 {
        a.register_user(&format!("a-filler-{i}"), &format!("a{i}@example.com"), None).unwrap();
    }
    let bob_on_a = a.register_user("bob", "bob@example.com", None).unwrap();
    assert_eq!(bob_on_a, 42);
    a.register_user("alice", "alice@example.com", None).unwrap();

    for i in 0..6 {
        b.register_user(&format!("b-filler-{i}"), &format!("b{i}@example.com"), None).unwrap();
    }
    let bob_on_b = b.register_user("bob", "bob@example.com", None).unwrap();
    assert_eq!(bob_on_b, 7);

    link(&a, &b, b_addr).await;

    let (_bob_session, mut bob_rx) = logged_in(&b, "bob");
    let key = UserKey {
        user_id: Some(bob_on_a),
        username: Some("bob".into()),
        email: Some("bob@example.com".into()),
    };
    wait_until("A sees bob on node-b", || {
        a.presence().plan_user_send(&key).remote_servers == vec!["node-b".to_string()]
    })
    .await;

    let (alice, _alice_rx) = logged_in(&a, "alice");
    let plan = a.send_direct(&alice, &key, "hello bob").unwrap();
    assert!(plan.local_sessions.is_empty());
    assert_eq!(plan.remote_servers, vec!["node-b".to_string()]);

    let payload = wait_for_payload(&mut bob_rx, |p| p["content"] == "hello bob", "DM on B").await;
    assert_eq!(payload["event"], "DIRECT_MESSAGE");
    assert_eq!(payload["sender"], "alice");

    let mesh = a.mesh();
    wait_until("ack received", || mesh.metrics().get(metrics::CONFIRMED) == 1).await;
    assert_eq!(mesh.delivery().pending_count(), 0);
    assert_eq!(mesh.metrics().get(metrics::RETRIED), 0);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn direct_message_to_offline_user_is_negatively_acked() {
    let (a, _) = start_node("node-a").await;
    let (b, b_addr) = start_node("node-b").await;
    a.register_user("alice", "alice@example.com", None).unwrap();
    link(&a, &b, b_addr).await;

    let key = UserKey { user_id: None, username: Some("carol".into()), email: None };
    let id = a.mesh().forward_to_user("node-b", &key, serde_json::json!({"content": "hi"}));
    assert!(id.is_some());
    assert_eq!(a.mesh().delivery().pending_count(), 1);

    let mesh = a.mesh();
    wait_until("negative ack", || mesh.metrics().get(metrics::FAILED) == 1).await;
    assert_eq!(mesh.delivery().pending_count(), 0);
    assert_eq!(mesh.metrics().get(metrics::CONFIRMED), 0);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn channel_message_reaches_remote_members() {
    let (a, _) = start_node("node-a").await;
    let (b, b_addr) = start_node("node-b").await;
    a.register_user("alice", "alice@example.com", None).unwrap();
    a.register_user("bob", "bob@example.com", None).unwrap();
    link(&a, &b, b_addr).await;

    let (alice, mut alice_rx) = logged_in(&a, "alice");
    let general = a.create_channel(&alice, "general", false).unwrap();

    let sync = b.synchronizer();
    wait_until("bob and general on B", || {
        sync.channel_by_uuid(&general.uuid).is_some() && sync.local_user_id(None, Some("bob")).is_some()
    })
    .await;
    let local_general = sync.channel_by_uuid(&general.uuid).unwrap();
    let (bob, mut bob_rx) = logged_in(&b, "bob");
    b.join_channel(&bob, local_general.id).unwrap();

    wait_until("A sees bob's membership", || {
        a.presence().plan_channel_send(Some(general.id), Some(&general.uuid), None).remote_servers
            == vec!["node-b".to_string()]
    })
    .await;

    a.send_channel(&alice, general.id, "welcome").unwrap();
    let payload = wait_for_payload(&mut bob_rx, |p| p["content"] == "welcome", "channel message on B").await;
    assert_eq!(payload["event"], "CHANNEL_MESSAGE");
    // The author's own session is skipped.
    assert_eq!(count_payloads(&mut alice_rx, |p| p["content"] == "welcome").await, 0);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn login_status_replicates_to_peer_store() {
    let (a, _) = start_node("node-a").await;
    let (b, b_addr) = start_node("node-b").await;
    b.register_user("bob", "bob@example.com", None).unwrap();
    link(&a, &b, b_addr).await;

    let sync = a.synchronizer();
    wait_until("bob replicated to A", || sync.local_user_id(None, Some("bob")).is_some()).await;
    let bob_on_a = sync.local_user_id(None, Some("bob")).unwrap();
    let online = || sync.user_by_id(bob_on_a).is_some_and(|u| u.online);
    assert!(!online());

    let (bob, _rx) = logged_in(&b, "bob");
    wait_until("bob online on A", || online()).await;

    b.close_session(&bob);
    wait_until("bob offline on A", || !online()).await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn dropped_peer_sessions_are_announced_locally() {
    let (a, _) = start_node("node-a").await;
    let (b, b_addr) = start_node("node-b").await;
    b.register_user("bob", "bob@example.com", None).unwrap();
    a.register_user("alice", "alice@example.com", None).unwrap();
    link(&a, &b, b_addr).await;

    let (_alice, mut alice_rx) = logged_in(&a, "alice");
    let (bob, _bob_rx) = logged_in(&b, "bob");
    wait_until("A sees bob's session", || !a.presence().remote_sessions("node-b").is_empty()).await;

    b.stop().await;

    let payload = wait_for_payload(
        &mut alice_rx,
        |p| p["event"] == "CLIENT_DISCONNECTED" && p["sessionId"] == bob.as_str(),
        "disconnect notice on A",
    )
    .await;
    assert_eq!(payload["serverId"], "node-b");
    assert!(a.presence().remote_sessions("node-b").is_empty());
    assert!(a.mesh().connected_peer_ids().is_empty());
    assert!(a.presence().known_servers().contains("node-b"));

    a.stop().await;
}

#[tokio::test]
async fn replicated_invitation_notifies_online_invitee() {
    let (a, _) = start_node("node-a").await;
    let (b, b_addr) = start_node("node-b").await;
    a.register_user("alice", "alice@example.com", None).unwrap();
    let bob_on_b = b.register_user("bob", "bob@example.com", None).unwrap();
    link(&a, &b, b_addr).await;

    let (alice, _alice_rx) = logged_in(&a, "alice");
    let secret = a.create_channel(&alice, "secret", true).unwrap();
    let sync = a.synchronizer();
    wait_until("bob replicated to A", || sync.local_user_id(None, Some("bob")).is_some()).await;
    let bob_on_a = sync.local_user_id(None, Some("bob")).unwrap();

    let (bob, mut bob_rx) = logged_in(&b, "bob");
    a.invite(&alice, secret.id, bob_on_a).unwrap();

    let payload = wait_for_payload(&mut bob_rx, |p| p["event"] == "INVITATION_RECEIVED", "invitation on B").await;
    assert_eq!(payload["channelUuid"], secret.uuid.as_str());
    assert_eq!(payload["channelName"], "secret");

    let pending = b
        .synchronizer()
        .with_db(|db| db.pending_invitations_for(bob_on_b))
        .unwrap();
    assert_eq!(pending.len(), 1);

    // Accepting on B joins the channel there, and the membership flows back.
    b.answer_invitation(&bob, pending[0].channel_id, true).unwrap();
    assert!(b.answer_invitation(&bob, pending[0].channel_id, true).is_err(), "already answered");
    wait_until("bob is a member on A", || {
        sync.with_db(|db| db.channel_members(secret.id))
            .is_some_and(|members| members.iter().any(|m| m.id == bob_on_a))
    })
    .await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn composite_session_id_reaches_remote_session() {
    let (a, _) = start_node("node-a").await;
    let (b, b_addr) = start_node("node-b").await;
    b.register_user("bob", "bob@example.com", None).unwrap();
    link(&a, &b, b_addr).await;

    let (bob, mut bob_rx) = logged_in(&b, "bob");
    wait_until("A sees bob's session", || !a.presence().remote_sessions("node-b").is_empty()).await;

    let plan = a
        .mesh()
        .send_to_session(&format!("node-b:{bob}"), serde_json::json!({"event": "NUDGE"}));
    assert!(plan.local_sessions.is_empty());
    assert_eq!(plan.remote_servers, vec!["node-b".to_string()]);
    wait_for_payload(&mut bob_rx, |p| p["event"] == "NUDGE", "session forward on B").await;

    a.stop().await;
    b.stop().await;
}
