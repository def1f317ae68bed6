//! Envelopes this node originates, and the routing step shared with relays.

use std::sync::Arc;

use serde_json::Value;

use super::PeerManager;
use super::link::PeerLink;
use crate::delivery::PendingMessage;
use crate::msgid;
use crate::presence::{SendPlan, SessionDescriptor, UserKey};
use crate::protocol::{
    BroadcastPayload, ChannelMessagePayload, ChannelUpdate, ClientDisconnection, DirectMessagePayload,
    MembershipAction, PeerEnvelope, PeerMessage, RemoteSessionSnapshot,
    ReplicationStatusPayload, SessionForward, SyncStatePayload,
};
use crate::snapshot::DatabaseSnapshot;

impl PeerManager {
    /// Queue one envelope on one link.
    pub(super) fn transmit(&self, link: &PeerLink, envelope: PeerEnvelope) -> bool {
        let sent = link.send(envelope);
        self.count_sent(usize::from(sent));
        sent
    }

    /// Send toward the envelope's target, or flood it. `source` is the link
    /// the envelope arrived on and never gets it back. Returns how many
    /// links the envelope was queued on.
    pub(super) fn route_envelope(&self, source: Option<&Arc<PeerLink>>, mut envelope: PeerEnvelope) -> usize {
        let is_source = |l: &PeerLink| source.is_some_and(|s| s.generation() == l.generation());
        let target = envelope.target().map(str::to_string);

        if let Some(target) = target.as_deref() {
            if let Some(direct) = self.directory.lookup(target) {
                if !is_source(&direct) {
                    // The peer always recognizes its own instance id.
                    if let Some(instance) = direct.instance_id() {
                        envelope.target = Some(instance);
                    }
                    return usize::from(self.transmit(&direct, envelope));
                }
            }
        }

        let mut sent = 0;
        for peer in self.directory.links() {
            if is_source(&peer) || !peer.is_established() {
                continue;
            }
            let is_target = target.as_deref().is_some_and(|t| peer.matches_identity(t));
            if !is_target && peer.route_identifier().is_some_and(|r| envelope.has_visited(&r)) {
                continue;
            }
            if self.transmit(&peer, envelope.clone()) {
                sent += 1;
            }
        }
        if sent == 0 {
            tracing::debug!(kind = %envelope.kind, target = ?target, "No route for envelope");
        }
        sent
    }

    /// A fresh envelope from this node, already stamped with our route entry
    /// and a new event id.
    fn originate(&self, message: &PeerMessage) -> Option<PeerEnvelope> {
        let mut envelope = match PeerEnvelope::new(self.server_id(), message) {
            Ok(e) => e,
            Err(e) => {
                tracing::error!(kind = %message.kind(), "Failed to encode envelope: {e}");
                return None;
            }
        };
        envelope.event_id = Some(msgid::pending_id(self.server_id()));
        envelope.mark_visited(self.instance_id());
        Some(envelope)
    }

    /// Flood to every established peer.
    fn flood(&self, message: &PeerMessage) -> usize {
        match self.originate(message) {
            Some(envelope) => self.route_envelope(None, envelope),
            None => 0,
        }
    }

    pub(super) fn send_targeted(&self, target: &str, message: &PeerMessage) -> usize {
        let target = target.trim();
        if target.is_empty() {
            tracing::debug!(kind = %message.kind(), "Dropping envelope with blank target");
            return 0;
        }
        match self.originate(message) {
            Some(envelope) => self.route_envelope(None, envelope.with_target(target)),
            None => 0,
        }
    }

    // ── State sync ─────────────────────────────────────────────────────

    /// Full presence plus database snapshot for a newly established peer.
    pub(super) fn send_sync_state(&self, link: &Arc<PeerLink>) {
        let database = match self.sync.capture_snapshot() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(peer = %link.describe(), "Failed to capture database snapshot: {e}");
                None
            }
        };
        let payload = SyncStatePayload { servers: self.presence.sessions_by_server(), database };
        if let Some(envelope) = self.originate(&PeerMessage::SyncState(payload)) {
            tracing::info!(peer = %link.describe(), "Sending state sync");
            self.transmit(link, envelope);
        }
    }

    /// Replicate a small set of database changes to the whole mesh.
    pub fn broadcast_database_update(&self, snapshot: DatabaseSnapshot) -> usize {
        if !self.is_running() || snapshot.is_empty() {
            return 0;
        }
        let payload = SyncStatePayload { servers: Default::default(), database: Some(snapshot) };
        self.flood(&PeerMessage::SyncState(payload))
    }

    // ── Presence ───────────────────────────────────────────────────────

    pub fn notify_client_login(&self, session: &SessionDescriptor) -> usize {
        if !self.is_running() || !session.is_authenticated() {
            return 0;
        }
        let snapshot = session.to_remote(self.server_id());
        self.flood(&PeerMessage::ClientConnected(snapshot))
    }

    pub fn notify_client_logout(&self, session: &SessionDescriptor) -> usize {
        if !self.is_running() {
            return 0;
        }
        let gone = ClientDisconnection {
            session_id: session.session_id.clone(),
            server_id: self.server_id().to_string(),
            user_id: session.user_id,
        };
        self.flood(&PeerMessage::ClientDisconnected(gone))
    }

    pub fn notify_channel_membership(
        &self,
        session: &SessionDescriptor,
        channel_id: i64,
        channel_uuid: Option<&str>,
        action: MembershipAction,
    ) -> usize {
        if !self.is_running() {
            return 0;
        }
        let update = ChannelUpdate {
            session_id: session.session_id.clone(),
            server_id: self.server_id().to_string(),
            user_id: session.user_id,
            channel_id,
            channel_uuid: channel_uuid.map(str::to_string),
            action,
        };
        self.flood(&PeerMessage::ChannelMembership(update))
    }

    /// Tell the rest of the mesh that a session of a peer we just lost is
    /// gone, as far as this node can tell.
    pub(super) fn relay_link_disconnect(&self, peer_id: &str, session: &RemoteSessionSnapshot) {
        let gone = ClientDisconnection {
            session_id: session.session_id.clone(),
            server_id: peer_id.to_string(),
            user_id: session.user_id,
        };
        self.flood(&PeerMessage::ClientDisconnected(gone));
    }

    // ── Broadcasts ─────────────────────────────────────────────────────

    /// Flood a client-facing payload to every node. Receivers deliver it to
    /// all their local sessions.
    pub fn broadcast(&self, message: Value) -> usize {
        if !self.is_running() {
            return 0;
        }
        self.flood(&PeerMessage::Broadcast(BroadcastPayload { message }))
    }

    /// Deliver to every local session and flood to the mesh.
    pub fn broadcast_everywhere(&self, message: Value) -> usize {
        let local = self.gateway.broadcast_local(&message);
        self.broadcast(message);
        local
    }

    pub fn replication_status(&self) -> ReplicationStatusPayload {
        ReplicationStatusPayload {
            server_id: self.server_id().to_string(),
            connected_peers: self.connected_peer_ids(),
            metrics: self.metrics.snapshot(),
            pending_count: self.delivery.pending_count(),
        }
    }

    pub fn broadcast_replication_status(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        self.flood(&PeerMessage::ReplicationStatus(self.replication_status()))
    }

    // ── Sends to users, channels, sessions ─────────────────────────────

    /// Deliver to a user wherever they are connected. Local sessions win;
    /// otherwise the message is forwarded, tracked, to each server that
    /// reports a session for the user.
    pub fn send_to_user(&self, key: &UserKey, message: Value) -> SendPlan {
        let plan = self.presence.plan_user_send(key);
        self.gateway.deliver_to_sessions(&plan.local_sessions, &message);
        for server in &plan.remote_servers {
            self.forward_to_user(server, key, message.clone());
        }
        plan
    }

    /// Deliver to a channel's members on this node and forward to every
    /// server with members in it. `sender_id` is skipped locally.
    pub fn send_to_channel(&self, channel_id: i64, sender_id: Option<i64>, message: Value) -> SendPlan {
        let uuid = self.sync.channel_by_id(channel_id).map(|c| c.uuid);
        let plan = self.presence.plan_channel_send(Some(channel_id), uuid.as_deref(), sender_id);
        self.gateway.deliver_to_sessions(&plan.local_sessions, &message);
        let sender_email = sender_id.and_then(|id| self.sync.user_by_id(id)).map(|u| u.email);
        for server in &plan.remote_servers {
            self.forward_to_channel(server, channel_id, uuid.as_deref(), sender_id, sender_email.as_deref(), message.clone());
        }
        plan
    }

    /// Deliver to one session, local or remote (`server:session` or a bare
    /// id known from some server's snapshot).
    pub fn send_to_session(&self, session_id: &str, message: Value) -> SendPlan {
        let plan = self.presence.plan_session_send(session_id);
        self.gateway.deliver_to_sessions(&plan.local_sessions, &message);
        let bare = self.presence.bare_session_id(session_id).to_string();
        for server in &plan.remote_servers {
            self.forward_to_session(server, &bare, message.clone());
        }
        plan
    }

    /// Forward a direct message to `target_server` and track it until
    /// acknowledged. Returns the message id.
    pub fn forward_to_user(&self, target_server: &str, key: &UserKey, message: Value) -> Option<String> {
        if !self.is_running() || target_server.trim().is_empty() {
            return None;
        }
        let message_id = msgid::pending_id(self.server_id());
        let dm = PeerMessage::DirectMessage(DirectMessagePayload {
            message_id: message_id.clone(),
            user_id: key.user_id,
            username: key.username.clone(),
            email: key.email.clone(),
            message,
        });
        self.send_tracked(target_server, &message_id, dm)
    }

    pub fn forward_to_channel(
        &self,
        target_server: &str,
        channel_id: i64,
        channel_uuid: Option<&str>,
        sender_id: Option<i64>,
        sender_email: Option<&str>,
        message: Value,
    ) -> Option<String> {
        if !self.is_running() || target_server.trim().is_empty() {
            return None;
        }
        let message_id = msgid::pending_id(self.server_id());
        let cm = PeerMessage::ChannelMessage(ChannelMessagePayload {
            message_id: message_id.clone(),
            channel_id: Some(channel_id),
            channel_uuid: channel_uuid.map(str::to_string),
            sender_id,
            sender_email: sender_email.map(str::to_string),
            message,
        });
        self.send_tracked(target_server, &message_id, cm)
    }

    /// Session forwards are fire-and-forget.
    pub fn forward_to_session(&self, target_server: &str, session_id: &str, message: Value) -> usize {
        if !self.is_running() {
            return 0;
        }
        let forward = PeerMessage::SessionMessage(SessionForward { session_id: session_id.to_string(), message });
        self.send_targeted(target_server, &forward)
    }

    fn send_tracked(&self, target_server: &str, message_id: &str, message: PeerMessage) -> Option<String> {
        let payload = match message.to_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(kind = %message.kind(), "Failed to encode tracked message: {e}");
                return None;
            }
        };
        if !self.delivery.track(message_id, target_server, message.kind(), payload) {
            return None;
        }
        let sent = self.send_targeted(target_server, &message);
        tracing::debug!(msg_id = %message_id, peer = %target_server, sent, "Forwarded tracked message");
        Some(message_id.to_string())
    }

    /// Send a pending message again under a fresh event id, so receivers
    /// that saw the first attempt do not discard it.
    pub(super) fn resend(&self, pending: &PendingMessage) {
        let message = match PeerMessage::decode(pending.kind, &pending.payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(msg_id = %pending.message_id, "Pending payload no longer decodes: {e}");
                return;
            }
        };
        self.send_targeted(&pending.target_server, &message);
    }
}
