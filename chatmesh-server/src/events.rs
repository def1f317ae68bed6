//! Local domain events.
//!
//! The client-facing layer publishes what happened on this node; the
//! replication listeners turn the events worth sharing into peer traffic.
//! The mesh publishes what arrived from peers that local clients should hear
//! about.

use tokio::sync::broadcast;

use crate::presence::SessionDescriptor;
use crate::protocol::RemoteSessionSnapshot;
use crate::sync::ReceivedInvitation;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum DomainEvent {
    UserRegistered { user_id: i64 },
    ChannelCreated { channel_id: i64 },
    ChannelJoined { channel_id: i64, user_id: i64, session_id: Option<String> },
    ChannelLeft { channel_id: i64, user_id: i64, session_id: Option<String> },
    InviteSent { channel_id: i64, invitee_id: i64 },
    InviteAccepted { channel_id: i64, invitee_id: i64 },
    InviteRejected { channel_id: i64, invitee_id: i64 },
    /// A local session authenticated.
    Login(SessionDescriptor),
    /// An authenticated local session closed.
    Logout(SessionDescriptor),
    /// A previously unknown pending invitation arrived in a snapshot.
    InvitationReceived(ReceivedInvitation),
    /// A remote session went away, either announced or because the link to
    /// its server dropped.
    RemoteSessionClosed(RemoteSessionSnapshot),
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::UserRegistered { .. } => "user_registered",
            DomainEvent::ChannelCreated { .. } => "channel_created",
            DomainEvent::ChannelJoined { .. } => "channel_joined",
            DomainEvent::ChannelLeft { .. } => "channel_left",
            DomainEvent::InviteSent { .. } => "invite_sent",
            DomainEvent::InviteAccepted { .. } => "invite_accepted",
            DomainEvent::InviteRejected { .. } => "invite_rejected",
            DomainEvent::Login(_) => "login",
            DomainEvent::Logout(_) => "logout",
            DomainEvent::InvitationReceived(_) => "invitation_received",
            DomainEvent::RemoteSessionClosed(_) => "remote_session_closed",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to every current subscriber. Events published while nobody
    /// listens are dropped.
    pub fn publish(&self, event: DomainEvent) {
        tracing::trace!(event = event.name(), "Publishing domain event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new();
        bus.publish(DomainEvent::UserRegistered { user_id: 0 });
        let mut rx = bus.subscribe();
        bus.publish(DomainEvent::UserRegistered { user_id: 1 });
        bus.publish(DomainEvent::ChannelCreated { channel_id: 2 });

        match rx.recv().await.unwrap() {
            DomainEvent::UserRegistered { user_id } => assert_eq!(user_id, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap().name(), "channel_created");
    }
}
