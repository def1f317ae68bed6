//! Turns local domain events into mesh traffic.
//!
//! Database mutations go out as small incremental snapshots, session
//! changes as presence envelopes. A user's first login and last logout on
//! this node also go out as a USER_STATUS_CHANGED broadcast, which every
//! receiving node applies to its own copy of the user's online flag.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::db;
use crate::error::SyncError;
use crate::events::{DomainEvent, EventBus};
use crate::gateway::LocalDeliveryGateway;
use crate::mesh::{PeerManager, USER_STATUS_CHANGED};
use crate::presence::{SessionDescriptor, UserKey};
use crate::protocol::MembershipAction;
use crate::snapshot::DatabaseSnapshot;
use crate::sync::ReceivedInvitation;

/// Authenticated sessions per user on this node.
#[derive(Default)]
struct SessionCounts {
    by_user: HashMap<i64, usize>,
}

impl SessionCounts {
    /// Returns the count after the login.
    fn login(&mut self, user_id: i64) -> usize {
        let slot = self.by_user.entry(user_id).or_insert(0);
        *slot += 1;
        *slot
    }

    /// Returns the count after the logout, or None for a user that was not
    /// counted as logged in.
    fn logout(&mut self, user_id: i64) -> Option<usize> {
        let slot = self.by_user.get_mut(&user_id)?;
        *slot = slot.saturating_sub(1);
        let left = *slot;
        if left == 0 {
            self.by_user.remove(&user_id);
        }
        Some(left)
    }
}

pub struct Replicator {
    manager: Arc<PeerManager>,
    gateway: Arc<dyn LocalDeliveryGateway>,
    sessions: Mutex<SessionCounts>,
}

impl Replicator {
    pub fn new(manager: Arc<PeerManager>, gateway: Arc<dyn LocalDeliveryGateway>) -> Self {
        Self { manager, gateway, sessions: Mutex::new(SessionCounts::default()) }
    }

    /// Subscribe to `events` and replicate until the bus closes.
    pub fn spawn(self: Arc<Self>, events: &EventBus) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            tracing::debug!(server = %self.manager.server_id(), "Replication listener started");
            loop {
                match rx.recv().await {
                    Ok(event) => self.handle(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Replication listener lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Replication listener stopped");
        })
    }

    pub fn handle(&self, event: &DomainEvent) {
        tracing::trace!(event = event.name(), "Replicating domain event");
        match event {
            DomainEvent::UserRegistered { user_id } => {
                self.replicate("user", self.manager.synchronizer().user_snapshot(*user_id));
            }
            DomainEvent::ChannelCreated { channel_id } => {
                self.replicate("channel", self.manager.synchronizer().channel_snapshot(*channel_id));
            }
            DomainEvent::ChannelJoined { channel_id, user_id, session_id } => {
                self.replicate(
                    "membership",
                    self.manager.synchronizer().membership_snapshot(*channel_id, *user_id),
                );
                self.membership(session_id.as_deref(), *channel_id, MembershipAction::Join);
            }
            DomainEvent::ChannelLeft { channel_id, session_id, .. } => {
                self.membership(session_id.as_deref(), *channel_id, MembershipAction::Leave);
            }
            DomainEvent::InviteSent { channel_id, invitee_id }
            | DomainEvent::InviteAccepted { channel_id, invitee_id }
            | DomainEvent::InviteRejected { channel_id, invitee_id } => {
                self.replicate(
                    "invitation",
                    self.manager.synchronizer().invitation_snapshot(*channel_id, *invitee_id),
                );
            }
            DomainEvent::Login(session) => self.on_login(session),
            DomainEvent::Logout(session) => self.on_logout(session),
            DomainEvent::InvitationReceived(received) => self.notify_invitee(received),
            DomainEvent::RemoteSessionClosed(_) => {}
        }
    }

    fn replicate(&self, what: &str, snapshot: Result<Option<DatabaseSnapshot>, SyncError>) {
        match snapshot {
            Ok(Some(snapshot)) => {
                let sent = self.manager.broadcast_database_update(snapshot);
                tracing::debug!(what, sent, "Replicated incremental snapshot");
            }
            Ok(None) => tracing::debug!(what, "Nothing to replicate, record is gone"),
            Err(e) => tracing::warn!(what, "Failed to capture incremental snapshot: {e}"),
        }
    }

    fn membership(&self, session_id: Option<&str>, channel_id: i64, action: MembershipAction) {
        let Some(session) = session_id.and_then(|id| self.manager.presence().local_session(id)) else {
            return;
        };
        let uuid = self.manager.synchronizer().channel_by_id(channel_id).map(|c| c.uuid);
        self.manager.notify_channel_membership(&session, channel_id, uuid.as_deref(), action);
    }

    fn on_login(&self, session: &SessionDescriptor) {
        let Some(user_id) = session.user_id else {
            return;
        };
        self.manager.notify_client_login(session);
        let active = self.sessions.lock().login(user_id);
        if active == 1 {
            self.announce_status(session, true, active);
        }
    }

    fn on_logout(&self, session: &SessionDescriptor) {
        let Some(user_id) = session.user_id else {
            return;
        };
        self.manager.notify_client_logout(session);
        if let Some(0) = self.sessions.lock().logout(user_id) {
            self.announce_status(session, false, 0);
        }
    }

    fn announce_status(&self, session: &SessionDescriptor, connected: bool, active: usize) {
        if let Some(user_id) = session.user_id {
            self.manager.synchronizer().with_db(|db| db.set_online(user_id, connected));
        }
        let notice = user_status_notice(session, connected, active);
        let local = self.manager.broadcast_everywhere(notice);
        tracing::info!(user_id = ?session.user_id, connected, local, "User status changed");
    }

    /// Tell an invitee who is online here about an invitation that just
    /// arrived from another node.
    fn notify_invitee(&self, received: &ReceivedInvitation) {
        let key = UserKey {
            user_id: Some(received.invitee.id),
            username: Some(received.invitee.username.clone()),
            email: Some(received.invitee.email.clone()),
        };
        let sessions = self.manager.presence().plan_user_send(&key).local_sessions;
        if sessions.is_empty() {
            return;
        }
        let notice = json!({
            "event": "INVITATION_RECEIVED",
            "invitationId": received.invitation.id,
            "channelId": received.channel.id,
            "channelUuid": received.channel.uuid,
            "channelName": received.channel.name,
            "inviterId": received.invitation.inviter_id,
            "createdAt": received.invitation.created_at,
        });
        let delivered = self.gateway.deliver_to_sessions(&sessions, &notice);
        tracing::debug!(invitee = received.invitee.id, delivered, "Notified invitee of replicated invitation");
    }
}

fn user_status_notice(session: &SessionDescriptor, connected: bool, active: usize) -> Value {
    json!({
        "event": USER_STATUS_CHANGED,
        "userId": session.user_id,
        "username": session.username,
        "email": session.email,
        "connected": connected,
        "activeSessions": active,
        "timestamp": db::now_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_login_and_last_logout() {
        let mut counts = SessionCounts::default();
        assert_eq!(counts.login(7), 1);
        assert_eq!(counts.login(7), 2);
        assert_eq!(counts.logout(7), Some(1));
        assert_eq!(counts.logout(7), Some(0));
        assert_eq!(counts.logout(7), None);
        assert_eq!(counts.login(7), 1);
    }

    #[test]
    fn status_notice_shape() {
        let session = SessionDescriptor {
            session_id: "session-1".into(),
            user_id: Some(3),
            username: Some("alice".into()),
            email: Some("alice@example.com".into()),
            ..Default::default()
        };
        let v = user_status_notice(&session, true, 1);
        assert_eq!(v["event"], USER_STATUS_CHANGED);
        assert_eq!(v["userId"], 3);
        assert_eq!(v["email"], "alice@example.com");
        assert_eq!(v["connected"], true);
        assert_eq!(v["activeSessions"], 1);
        assert!(v["timestamp"].as_str().is_some());
    }
}
