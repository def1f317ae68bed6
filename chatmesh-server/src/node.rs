//! One chat server node: the store, presence, the mesh and the replication
//! listener wired together.
//!
//! The client-facing operations below are the narrow slice of a chat
//! server's command layer that drives replication: each one mutates local
//! state and publishes the matching domain event.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::db::{self, Channel, Db, InvitationStatus, Message};
use crate::events::{DomainEvent, EventBus};
use crate::gateway::{LocalDeliveryGateway, SessionOutbox};
use crate::mesh::{MeshContext, PeerManager};
use crate::metrics::ReplicationMetrics;
use crate::presence::{PresenceDirectory, SendPlan, SessionDescriptor, UserKey};
use crate::replication::Replicator;
use crate::sync::StateSynchronizer;

pub struct Node {
    config: NodeConfig,
    sync: Arc<StateSynchronizer>,
    presence: Arc<PresenceDirectory>,
    outbox: Arc<SessionOutbox>,
    events: EventBus,
    mesh: Arc<PeerManager>,
    replicator: Arc<Replicator>,
    replication_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self> {
        let db = match &config.db_path {
            Some(path) => {
                tracing::info!("Opening database: {}", path.display());
                Db::open(path).with_context(|| format!("Failed to open database {}", path.display()))?
            }
            None => Db::open_memory().context("Failed to open in-memory database")?,
        };
        let sync = Arc::new(StateSynchronizer::new(db, config.max_blob_bytes));
        let presence = Arc::new(PresenceDirectory::new(&config.server_id));
        let outbox = Arc::new(SessionOutbox::new());
        let gateway: Arc<dyn LocalDeliveryGateway> = outbox.clone();
        let events = EventBus::new();
        let mesh = PeerManager::new(
            &config,
            MeshContext {
                sync: Arc::clone(&sync),
                presence: Arc::clone(&presence),
                gateway: Arc::clone(&gateway),
                events: events.clone(),
                metrics: Arc::new(ReplicationMetrics::new()),
            },
        );
        let replicator = Arc::new(Replicator::new(Arc::clone(&mesh), gateway));
        Ok(Self {
            config,
            sync,
            presence,
            outbox,
            events,
            mesh,
            replicator,
            replication_task: Mutex::new(None),
        })
    }

    /// Start replicating and open the peer listener. Returns its address.
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut task = self.replication_task.lock();
            if task.is_none() {
                *task = Some(Arc::clone(&self.replicator).spawn(&self.events));
            }
        }
        let addr = self
            .mesh
            .start()
            .await
            .with_context(|| format!("Failed to start peer listener on {}", self.config.listen_addr))?;
        tracing::info!(server = %self.config.server_id, "Node started on {addr}");
        Ok(addr)
    }

    /// Start and block until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        self.start().await?;
        tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
        tracing::info!("Shutdown requested");
        self.stop().await;
        Ok(())
    }

    pub async fn stop(&self) {
        self.mesh.stop().await;
        if let Some(task) = self.replication_task.lock().take() {
            task.abort();
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn mesh(&self) -> &Arc<PeerManager> {
        &self.mesh
    }

    pub fn synchronizer(&self) -> &Arc<StateSynchronizer> {
        &self.sync
    }

    pub fn presence(&self) -> &Arc<PresenceDirectory> {
        &self.presence
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn connect_to_peer(&self, host: &str, port: u16) -> Result<()> {
        self.mesh.connect_to_peer(host, port).await?;
        Ok(())
    }

    fn db<R>(&self, what: &str, f: impl FnOnce(&Db) -> rusqlite::Result<R>) -> Result<R> {
        self.sync.with_db(f).ok_or_else(|| anyhow!("Database error while trying to {what}"))
    }

    // ── Sessions ───────────────────────────────────────────────────────

    /// Open an anonymous client session. The receiver gets every line the
    /// node pushes to the client.
    pub fn open_session(&self, ip: Option<&str>) -> (String, mpsc::UnboundedReceiver<String>) {
        let session_id = self.presence.open_session(ip);
        let rx = self.outbox.attach(&session_id);
        tracing::debug!(session = %session_id, "Client session opened");
        (session_id, rx)
    }

    pub fn register_user(&self, username: &str, email: &str, password: Option<&str>) -> Result<i64> {
        let user_id = self.db("register user", |db| db.insert_user(username, email, password, None))?;
        tracing::info!(user_id, username, "User registered");
        self.events.publish(DomainEvent::UserRegistered { user_id });
        Ok(user_id)
    }

    /// Authenticate a session as a user found by username or email.
    pub fn login(&self, session_id: &str, login: &str) -> Result<SessionDescriptor> {
        let user = self
            .db("look up user", |db| match db.user_by_username(login)? {
                Some(u) => Ok(Some(u)),
                None => db.user_by_email(login),
            })?
            .ok_or_else(|| anyhow!("Unknown user {login}"))?;
        let session = self
            .presence
            .authenticate(session_id, user.id, &user.username, &user.email)
            .ok_or_else(|| anyhow!("Unknown session {session_id}"))?;
        tracing::info!(session = %session_id, user_id = user.id, "Client logged in");
        self.events.publish(DomainEvent::Login(session.clone()));
        Ok(session)
    }

    pub fn close_session(&self, session_id: &str) -> Option<SessionDescriptor> {
        let session = self.presence.close_session(session_id)?;
        self.outbox.detach(session_id);
        if session.is_authenticated() {
            self.events.publish(DomainEvent::Logout(session.clone()));
        }
        tracing::debug!(session = %session_id, "Client session closed");
        Some(session)
    }

    // ── Channels ───────────────────────────────────────────────────────

    /// Create a channel owned by the session's user, who joins it.
    pub fn create_channel(&self, session_id: &str, name: &str, private: bool) -> Result<Channel> {
        let user_id = self.session_user(session_id)?;
        let channel = self.db("create channel", |db| {
            let channel = db.create_channel(name, private)?;
            db.add_member(channel.id, user_id)?;
            Ok(channel)
        })?;
        self.presence.join_channel(session_id, channel.id, Some(&channel.uuid));
        tracing::info!(channel = channel.id, uuid = %channel.uuid, name, "Channel created");
        self.events.publish(DomainEvent::ChannelCreated { channel_id: channel.id });
        self.events.publish(DomainEvent::ChannelJoined {
            channel_id: channel.id,
            user_id,
            session_id: Some(session_id.to_string()),
        });
        Ok(channel)
    }

    pub fn join_channel(&self, session_id: &str, channel_id: i64) -> Result<()> {
        let user_id = self.session_user(session_id)?;
        let channel = self.existing_channel(channel_id)?;
        self.db("join channel", |db| db.add_member(channel.id, user_id))?;
        self.presence.join_channel(session_id, channel.id, Some(&channel.uuid));
        self.events.publish(DomainEvent::ChannelJoined {
            channel_id,
            user_id,
            session_id: Some(session_id.to_string()),
        });
        Ok(())
    }

    pub fn leave_channel(&self, session_id: &str, channel_id: i64) -> Result<()> {
        let user_id = self.session_user(session_id)?;
        self.db("leave channel", |db| db.remove_member(channel_id, user_id))?;
        self.presence.leave_channel(session_id, channel_id);
        self.events.publish(DomainEvent::ChannelLeft {
            channel_id,
            user_id,
            session_id: Some(session_id.to_string()),
        });
        Ok(())
    }

    pub fn invite(&self, session_id: &str, channel_id: i64, invitee_id: i64) -> Result<()> {
        let inviter_id = self.session_user(session_id)?;
        self.existing_channel(channel_id)?;
        let invitation = self.db("create invitation", |db| db.create_invitation(channel_id, inviter_id, invitee_id))?;
        tracing::info!(invitation = invitation.id, channel = channel_id, invitee_id, "Invitation sent");
        self.events.publish(DomainEvent::InviteSent { channel_id, invitee_id });
        Ok(())
    }

    /// Accept or reject the session user's pending invitation to a channel.
    /// Accepting joins the channel.
    pub fn answer_invitation(&self, session_id: &str, channel_id: i64, accept: bool) -> Result<()> {
        let invitee_id = self.session_user(session_id)?;
        let invitation = self
            .db("look up invitation", |db| db::invitation_for(db.conn(), channel_id, invitee_id))?
            .ok_or_else(|| anyhow!("No invitation to channel {channel_id}"))?;
        if invitation.status != InvitationStatus::Pending {
            bail!("Invitation to channel {channel_id} was already answered");
        }
        let status = if accept { InvitationStatus::Accepted } else { InvitationStatus::Rejected };
        self.db("answer invitation", |db| db.set_invitation_status(invitation.id, status))?;
        if accept {
            self.events.publish(DomainEvent::InviteAccepted { channel_id, invitee_id });
            self.join_channel(session_id, channel_id)?;
        } else {
            self.events.publish(DomainEvent::InviteRejected { channel_id, invitee_id });
        }
        Ok(())
    }

    // ── Messages ───────────────────────────────────────────────────────

    /// Send a text message to a user wherever they are connected.
    pub fn send_direct(&self, session_id: &str, to: &UserKey, text: &str) -> Result<SendPlan> {
        let sender_id = self.session_user(session_id)?;
        let receiver_id = match to.user_id {
            Some(id) => Some(id),
            None => self.sync.local_user_id(to.email.as_deref(), to.username.as_deref()),
        };
        let message = Message {
            timestamp: db::now_rfc3339(),
            kind: db::TEXT.to_string(),
            sender_id: Some(sender_id),
            receiver_id,
            content: Some(text.to_string()),
            ..Default::default()
        };
        let id = self.db("store message", |db| db.insert_message(&message))?;
        let payload = self.message_payload("DIRECT_MESSAGE", id, &message);
        Ok(self.mesh.send_to_user(to, payload))
    }

    /// Send a text message to every member of a channel, on any node.
    pub fn send_channel(&self, session_id: &str, channel_id: i64, text: &str) -> Result<SendPlan> {
        let sender_id = self.session_user(session_id)?;
        self.existing_channel(channel_id)?;
        let message = Message {
            timestamp: db::now_rfc3339(),
            kind: db::TEXT.to_string(),
            sender_id: Some(sender_id),
            channel_id: Some(channel_id),
            content: Some(text.to_string()),
            ..Default::default()
        };
        let id = self.db("store message", |db| db.insert_message(&message))?;
        let payload = self.message_payload("CHANNEL_MESSAGE", id, &message);
        Ok(self.mesh.send_to_channel(channel_id, Some(sender_id), payload))
    }

    fn message_payload(&self, event: &str, id: i64, message: &Message) -> Value {
        let sender = message.sender_id.and_then(|id| self.sync.user_by_id(id));
        json!({
            "event": event,
            "messageId": id,
            "serverId": self.config.server_id,
            "timestamp": message.timestamp,
            "sender": sender.as_ref().map(|u| u.username.clone()),
            "senderEmail": sender.as_ref().map(|u| u.email.clone()),
            "channelId": message.channel_id,
            "content": message.content,
        })
    }

    fn session_user(&self, session_id: &str) -> Result<i64> {
        self.presence
            .local_session(session_id)
            .ok_or_else(|| anyhow!("Unknown session {session_id}"))?
            .user_id
            .ok_or_else(|| anyhow!("Session {session_id} is not logged in"))
    }

    fn existing_channel(&self, channel_id: i64) -> Result<Channel> {
        self.sync
            .channel_by_id(channel_id)
            .ok_or_else(|| anyhow!("Unknown channel {channel_id}"))
    }
}
