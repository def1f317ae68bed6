//! Inbound envelopes.
//!
//! Every envelope is stamped with this node's instance id on arrival. A node
//! that finds itself already on the route, or sees an event id it already
//! processed, drops the envelope. Envelopes addressed to some other node are
//! passed along without being decoded; everything else is dispatched here
//! and, if it changed local state, relayed to the remaining peers.

use std::sync::Arc;

use serde_json::Value;

use super::PeerManager;
use super::link::PeerLink;
use crate::events::DomainEvent;
use crate::identity::normalize;
use crate::metrics;
use crate::presence::UserKey;
use crate::protocol::{
    AckPayload, BroadcastPayload, ChannelMessagePayload, ChannelUpdate, ClientDisconnection,
    DirectMessagePayload, MessageKind, PeerEnvelope, PeerMessage, RemoteSessionSnapshot,
    ReplicationStatusPayload, SessionForward, SyncStatePayload,
};
use crate::redact;

/// Broadcast event that flips a user's online flag cluster-wide.
pub const USER_STATUS_CHANGED: &str = "USER_STATUS_CHANGED";

impl PeerManager {
    pub(super) fn handle_line(&self, link: &Arc<PeerLink>, line: &str) {
        let envelope = match PeerEnvelope::from_line(line) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(peer = %link.describe(), "Malformed peer envelope: {e} (line: {})", redact::line_for_log(line));
                return;
            }
        };
        self.metrics.increment(metrics::RECEIVED);
        if envelope.kind != MessageKind::Hello {
            tracing::debug!(
                peer = %link.describe(),
                kind = %envelope.kind,
                origin = %envelope.origin,
                "Peer received: {}",
                redact::for_log(&envelope.payload)
            );
        }
        self.handle_incoming(link, envelope);
    }

    /// Route or dispatch one envelope that arrived on `link`.
    pub fn handle_incoming(&self, link: &Arc<PeerLink>, mut envelope: PeerEnvelope) {
        if envelope.kind == MessageKind::Hello {
            match envelope.decode() {
                Ok(PeerMessage::Hello(hello)) => self.on_hello(link, hello, &envelope.origin),
                Ok(_) => {}
                Err(e) => tracing::warn!(peer = %link.describe(), "Malformed HELLO: {e}"),
            }
            return;
        }

        if !envelope.mark_visited(self.instance_id()) {
            tracing::debug!(kind = %envelope.kind, origin = %envelope.origin, "Envelope already passed through this node, dropping");
            return;
        }
        if let Some(event_id) = envelope.event_id.as_deref() {
            if !self.dedup.check_and_insert(event_id) {
                tracing::debug!(kind = %envelope.kind, event_id, "Duplicate envelope, dropping");
                return;
            }
        }

        if let Some(target) = envelope.target() {
            if !self.aliases.is_local(target) {
                let target = target.to_string();
                let sent = self.route_envelope(Some(link), envelope);
                tracing::debug!(target = %target, sent, "Forwarded envelope toward target");
                return;
            }
        }

        let message = match envelope.decode() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(peer = %link.describe(), kind = %envelope.kind, "Malformed payload: {e}");
                return;
            }
        };
        self.dispatch(link, &envelope, message);
    }

    fn dispatch(&self, link: &Arc<PeerLink>, envelope: &PeerEnvelope, message: PeerMessage) {
        match message {
            PeerMessage::Hello(_) => {
                tracing::debug!(origin = %envelope.origin, "Ignoring routed HELLO");
            }
            PeerMessage::SyncState(sync) => self.on_sync_state(link, envelope, sync),
            PeerMessage::ClientConnected(session) => self.on_client_connected(link, envelope, session),
            PeerMessage::ClientDisconnected(gone) => self.on_client_disconnected(link, envelope, gone),
            PeerMessage::ChannelMembership(update) => self.on_channel_membership(link, envelope, update),
            PeerMessage::DirectMessage(dm) => {
                let result = self.deliver_direct(&dm);
                self.acknowledge(envelope, &dm.message_id, result);
            }
            PeerMessage::ChannelMessage(cm) => {
                let result = self.deliver_channel(&cm);
                self.acknowledge(envelope, &cm.message_id, result);
            }
            PeerMessage::SessionMessage(forward) => self.deliver_session(&forward),
            PeerMessage::Broadcast(broadcast) => self.on_broadcast(link, envelope, broadcast),
            PeerMessage::DirectMessageAck(ack) | PeerMessage::ChannelMessageAck(ack) => {
                self.on_ack(&ack);
            }
            PeerMessage::ReplicationStatus(status) => self.on_replication_status(link, envelope, status),
        }
    }

    /// Pass an applied envelope on to every other peer.
    fn relay(&self, source: &Arc<PeerLink>, envelope: &PeerEnvelope) {
        let sent = self.route_envelope(Some(source), envelope.clone());
        tracing::trace!(kind = %envelope.kind, sent, "Relayed state update");
    }

    // ── Presence ───────────────────────────────────────────────────────

    /// The server a presence record belongs to, as this node names it.
    ///
    /// A peer whose declared id clashed was admitted under a different
    /// canonical id; its own records still carry the declared one and are
    /// renamed here. Records naming this node are ignored.
    fn effective_server(&self, link: &PeerLink, declared: &str) -> Option<String> {
        let declared = declared.trim();
        if declared.is_empty() {
            return link.remote_id();
        }
        if let (Some(announced), Some(resolved)) = (link.declared_id(), link.remote_id()) {
            if normalize(&announced) == normalize(declared) && normalize(&resolved) != normalize(declared) {
                return Some(resolved);
            }
        }
        if self.aliases.is_local(declared) {
            return None;
        }
        Some(declared.to_string())
    }

    /// True when `server` is a direct peer reached over some other link and
    /// the envelope was not written by that server itself. Its own link is
    /// the better source for its state.
    fn is_second_hand(&self, link: &PeerLink, envelope: &PeerEnvelope, server: &str) -> bool {
        if normalize(&envelope.origin) == normalize(server) {
            return false;
        }
        self.directory
            .lookup(server)
            .is_some_and(|direct| direct.generation() != link.generation())
    }

    fn on_sync_state(&self, link: &Arc<PeerLink>, envelope: &PeerEnvelope, sync: SyncStatePayload) {
        let mut presence_changed = false;
        for (server, sessions) in sync.servers {
            let Some(server) = self.effective_server(link, &server) else {
                continue;
            };
            if self.is_second_hand(link, envelope, &server) {
                tracing::trace!(server = %server, "Skipping second-hand presence for direct peer");
                continue;
            }
            presence_changed |= self.presence.register_remote_sessions(&server, sessions);
        }

        let mut db_changed = false;
        if let Some(snapshot) = sync.database.as_ref().filter(|s| !s.is_empty()) {
            match self.sync.apply_snapshot(snapshot) {
                Ok(outcome) => {
                    db_changed = outcome.changed;
                    if db_changed {
                        tracing::info!(peer = %link.describe(), origin = %envelope.origin, "Database synchronized from peer state");
                    }
                    for received in outcome.new_invitations {
                        self.events.publish(DomainEvent::InvitationReceived(received));
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %link.describe(), origin = %envelope.origin, "Failed to apply peer snapshot: {e}");
                }
            }
        }

        if presence_changed || db_changed {
            self.relay(link, envelope);
        }
    }

    fn on_client_connected(&self, link: &Arc<PeerLink>, envelope: &PeerEnvelope, session: RemoteSessionSnapshot) {
        let declared = if session.server_id.trim().is_empty() { envelope.origin.clone() } else { session.server_id.clone() };
        let Some(server) = self.effective_server(link, &declared) else {
            return;
        };
        if self.presence.register_remote_session(&server, session) {
            self.relay(link, envelope);
        }
    }

    fn on_client_disconnected(&self, link: &Arc<PeerLink>, envelope: &PeerEnvelope, gone: ClientDisconnection) {
        let declared = if gone.server_id.trim().is_empty() { envelope.origin.clone() } else { gone.server_id.clone() };
        let Some(server) = self.effective_server(link, &declared) else {
            return;
        };
        if self.is_second_hand(link, envelope, &server) {
            tracing::debug!(server = %server, session = %gone.session_id, "Ignoring third-party disconnect for a direct peer");
            return;
        }
        if let Some(session) = self.presence.remove_remote_session(&server, &gone.session_id) {
            self.announce_remote_disconnect(&session);
            self.relay(link, envelope);
        }
    }

    fn on_channel_membership(&self, link: &Arc<PeerLink>, envelope: &PeerEnvelope, update: ChannelUpdate) {
        let declared = if update.server_id.trim().is_empty() { envelope.origin.clone() } else { update.server_id.clone() };
        let Some(server) = self.effective_server(link, &declared) else {
            return;
        };
        let changed = self.presence.update_remote_channel(
            &server,
            &update.session_id,
            update.channel_id,
            update.channel_uuid.as_deref(),
            update.action,
        );
        if changed {
            self.relay(link, envelope);
        }
    }

    /// Let local clients know a remote session went away.
    pub(super) fn announce_remote_disconnect(&self, session: &RemoteSessionSnapshot) {
        self.events.publish(DomainEvent::RemoteSessionClosed(session.clone()));
        let notice = serde_json::json!({
            "event": "CLIENT_DISCONNECTED",
            "sessionId": session.session_id,
            "serverId": session.server_id,
            "userId": session.user_id,
            "username": session.username,
        });
        self.gateway.broadcast_local(&notice);
    }

    // ── Delivery ───────────────────────────────────────────────────────

    /// Deliver a forwarded direct message to the recipient's local sessions.
    /// The recipient is found by email or username; the id in the payload
    /// is the sender's numbering and is not trusted here.
    fn deliver_direct(&self, dm: &DirectMessagePayload) -> Result<usize, String> {
        let email = dm.email.as_deref().filter(|e| !e.trim().is_empty());
        let username = dm.username.as_deref().filter(|u| !u.trim().is_empty());
        if email.is_none() && username.is_none() {
            return Err("recipient has no email or username".into());
        }
        let key = UserKey {
            user_id: self.sync.local_user_id(email, username),
            username: username.map(str::to_string),
            email: email.map(str::to_string),
        };
        let sessions = self.presence.plan_user_send(&key).local_sessions;
        if sessions.is_empty() {
            return Err("recipient not connected to this server".into());
        }
        let delivered = self.gateway.deliver_to_sessions(&sessions, &dm.message);
        if delivered == 0 {
            return Err("recipient sessions closed".into());
        }
        tracing::debug!(msg_id = %dm.message_id, user_id = ?key.user_id, delivered, "Delivered forwarded direct message");
        Ok(delivered)
    }

    fn deliver_channel(&self, cm: &ChannelMessagePayload) -> Result<usize, String> {
        let channel = match cm.channel_uuid.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(uuid) => self.sync.channel_by_uuid(uuid),
            None => cm.channel_id.and_then(|id| self.sync.channel_by_id(id)),
        };
        let Some(channel) = channel else {
            return Err("channel not found".into());
        };
        let sender = self.sync.local_user_id(cm.sender_email.as_deref(), None);
        let plan = self.presence.plan_channel_send(Some(channel.id), Some(&channel.uuid), sender);
        let delivered = self.gateway.deliver_to_sessions(&plan.local_sessions, &cm.message);
        tracing::debug!(msg_id = %cm.message_id, channel = channel.id, delivered, "Delivered forwarded channel message");
        Ok(delivered)
    }

    fn deliver_session(&self, forward: &SessionForward) {
        let session_id = self.presence.bare_session_id(&forward.session_id);
        if !self.gateway.deliver_to_session(session_id, &forward.message) {
            tracing::debug!(session = %forward.session_id, "Forwarded session message had no local session");
        }
    }

    /// Reply to a tracked forward. Acks head back to the instance that
    /// originated the envelope.
    fn acknowledge(&self, envelope: &PeerEnvelope, message_id: &str, result: Result<usize, String>) {
        let Some(message) = ack_message(envelope.kind, message_id, self.server_id(), result) else {
            tracing::warn!(kind = %envelope.kind, msg_id = %message_id, "No acknowledgment defined for kind, dropping");
            return;
        };
        let reply_to = envelope.route.first().cloned().unwrap_or_else(|| envelope.origin.clone());
        self.send_targeted(&reply_to, &message);
    }

    fn on_ack(&self, ack: &AckPayload) {
        self.delivery.acknowledge(ack);
    }

    // ── Broadcast & status ─────────────────────────────────────────────

    fn on_broadcast(&self, link: &Arc<PeerLink>, envelope: &PeerEnvelope, broadcast: BroadcastPayload) {
        let delivered = self.gateway.broadcast_local(&broadcast.message);
        tracing::debug!(origin = %envelope.origin, delivered, "Broadcast delivered locally");
        self.apply_side_effects(&broadcast.message);
        self.relay(link, envelope);
    }

    /// Cluster-wide side effects carried by broadcasts.
    fn apply_side_effects(&self, message: &Value) {
        let event = message.get("event").and_then(Value::as_str).unwrap_or_default();
        if !event.eq_ignore_ascii_case(USER_STATUS_CHANGED) {
            return;
        }
        let email = message.get("email").and_then(Value::as_str);
        let username = message.get("username").and_then(Value::as_str);
        let Some(connected) = message.get("connected").and_then(Value::as_bool) else {
            tracing::warn!("USER_STATUS_CHANGED without `connected` flag");
            return;
        };
        match self.sync.apply_user_status(email, username, connected) {
            Ok(changed) => {
                tracing::debug!(email = ?email, username = ?username, connected, changed, "Applied remote user status");
            }
            Err(e) => tracing::warn!("Failed to apply remote user status: {e}"),
        }
    }

    fn on_replication_status(&self, link: &Arc<PeerLink>, envelope: &PeerEnvelope, status: ReplicationStatusPayload) {
        let server = if status.server_id.trim().is_empty() { envelope.origin.clone() } else { status.server_id.clone() };
        let Some(server) = self.effective_server(link, &server) else {
            return;
        };
        let changed = {
            let mut statuses = self.statuses.write();
            if statuses.get(&server) == Some(&status) {
                false
            } else {
                statuses.insert(server.clone(), status);
                true
            }
        };
        tracing::debug!(server = %server, changed, "Replication status received");
        if changed {
            self.relay(link, envelope);
        }
    }
}

/// The acknowledgment answering a `kind` request, or None for kinds that
/// are not acknowledged.
fn ack_message(kind: MessageKind, message_id: &str, server_id: &str, result: Result<usize, String>) -> Option<PeerMessage> {
    let ack_kind = kind.ack_kind()?;
    let (success, error) = match result {
        Ok(_) => (true, None),
        Err(e) => {
            tracing::debug!(msg_id = %message_id, "Delivery failed: {e}");
            (false, Some(e))
        }
    };
    let ack = AckPayload {
        message_id: message_id.to_string(),
        origin_server_id: server_id.to_string(),
        success,
        error,
    };
    match ack_kind {
        MessageKind::ChannelMessageAck => Some(PeerMessage::ChannelMessageAck(ack)),
        MessageKind::DirectMessageAck => Some(PeerMessage::DirectMessageAck(ack)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acks_match_the_request_kind() {
        let dm = ack_message(MessageKind::DirectMessage, "alpha:1", "beta", Ok(1));
        assert!(matches!(dm, Some(PeerMessage::DirectMessageAck(ref a)) if a.success && a.origin_server_id == "beta"));

        let cm = ack_message(MessageKind::ChannelMessage, "alpha:2", "beta", Err("channel not found".into()));
        match cm {
            Some(PeerMessage::ChannelMessageAck(a)) => {
                assert!(!a.success);
                assert_eq!(a.error.as_deref(), Some("channel not found"));
            }
            other => panic!("unexpected ack: {other:?}"),
        }

        assert!(ack_message(MessageKind::SessionMessage, "alpha:3", "beta", Ok(1)).is_none());
        assert!(ack_message(MessageKind::Broadcast, "alpha:4", "beta", Ok(1)).is_none());
    }
}
