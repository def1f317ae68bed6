//! Peer wire protocol.
//!
//! Each peer link carries newline-delimited JSON envelopes:
//!
//! ```json
//! {"type":"HELLO","origin":"alpha","payload":{"serverId":"alpha","instanceId":"6f1c..."}}
//! {"type":"DIRECT_MESSAGE","origin":"alpha","target":"beta","route":["6f1c..."],"payload":{...}}
//! ```
//!
//! `route` lists the instance ids of every node the envelope has passed
//! through. A node that finds itself already listed drops the envelope.
//! The payload is kept as raw JSON on the envelope and decoded into a
//! [`PeerMessage`] only when the envelope is dispatched locally, so
//! forwarding nodes never need to understand it.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snapshot::DatabaseSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Hello,
    SyncState,
    ClientConnected,
    ClientDisconnected,
    ChannelMembership,
    DirectMessage,
    ChannelMessage,
    SessionMessage,
    Broadcast,
    DirectMessageAck,
    ChannelMessageAck,
    ReplicationStatus,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Hello => "HELLO",
            MessageKind::SyncState => "SYNC_STATE",
            MessageKind::ClientConnected => "CLIENT_CONNECTED",
            MessageKind::ClientDisconnected => "CLIENT_DISCONNECTED",
            MessageKind::ChannelMembership => "CHANNEL_MEMBERSHIP",
            MessageKind::DirectMessage => "DIRECT_MESSAGE",
            MessageKind::ChannelMessage => "CHANNEL_MESSAGE",
            MessageKind::SessionMessage => "SESSION_MESSAGE",
            MessageKind::Broadcast => "BROADCAST",
            MessageKind::DirectMessageAck => "DIRECT_MESSAGE_ACK",
            MessageKind::ChannelMessageAck => "CHANNEL_MESSAGE_ACK",
            MessageKind::ReplicationStatus => "REPLICATION_STATUS",
        }
    }

    /// Kinds whose delivery is tracked until acknowledged.
    pub fn is_tracked(self) -> bool {
        matches!(self, MessageKind::DirectMessage | MessageKind::ChannelMessage)
    }

    /// The acknowledgment kind answering this kind, if any.
    pub fn ack_kind(self) -> Option<MessageKind> {
        match self {
            MessageKind::DirectMessage => Some(MessageKind::DirectMessageAck),
            MessageKind::ChannelMessage => Some(MessageKind::ChannelMessageAck),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One routed unit of peer traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEnvelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub route: Vec<String>,
    /// `{origin}:{ulid}` stamped by the originating node, used to drop
    /// copies that reach a node by more than one path.
    #[serde(default, rename = "eventId", skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl PeerEnvelope {
    pub fn new(origin: impl Into<String>, message: &PeerMessage) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: message.kind(),
            origin: origin.into(),
            target: None,
            route: Vec::new(),
            event_id: None,
            payload: message.to_payload()?,
        })
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Record `node` as visited. Returns false when it was already listed.
    pub fn mark_visited(&mut self, node: &str) -> bool {
        if self.has_visited(node) {
            return false;
        }
        self.route.push(node.to_string());
        true
    }

    pub fn has_visited(&self, node: &str) -> bool {
        let node = node.trim();
        !node.is_empty() && self.route.iter().any(|r| r.trim().eq_ignore_ascii_case(node))
    }

    /// Target with surrounding whitespace removed; blank targets count as none.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    pub fn decode(&self) -> Result<PeerMessage, serde_json::Error> {
        PeerMessage::decode(self.kind, &self.payload)
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Decoded envelope payloads. Matching on this is exhaustive, so a new
/// message kind cannot be added without handling it.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Hello(HelloPayload),
    SyncState(SyncStatePayload),
    ClientConnected(RemoteSessionSnapshot),
    ClientDisconnected(ClientDisconnection),
    ChannelMembership(ChannelUpdate),
    DirectMessage(DirectMessagePayload),
    ChannelMessage(ChannelMessagePayload),
    SessionMessage(SessionForward),
    Broadcast(BroadcastPayload),
    DirectMessageAck(AckPayload),
    ChannelMessageAck(AckPayload),
    ReplicationStatus(ReplicationStatusPayload),
}

fn parse<T: DeserializeOwned>(payload: &Value) -> Result<T, serde_json::Error> {
    T::deserialize(payload)
}

impl PeerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            PeerMessage::Hello(_) => MessageKind::Hello,
            PeerMessage::SyncState(_) => MessageKind::SyncState,
            PeerMessage::ClientConnected(_) => MessageKind::ClientConnected,
            PeerMessage::ClientDisconnected(_) => MessageKind::ClientDisconnected,
            PeerMessage::ChannelMembership(_) => MessageKind::ChannelMembership,
            PeerMessage::DirectMessage(_) => MessageKind::DirectMessage,
            PeerMessage::ChannelMessage(_) => MessageKind::ChannelMessage,
            PeerMessage::SessionMessage(_) => MessageKind::SessionMessage,
            PeerMessage::Broadcast(_) => MessageKind::Broadcast,
            PeerMessage::DirectMessageAck(_) => MessageKind::DirectMessageAck,
            PeerMessage::ChannelMessageAck(_) => MessageKind::ChannelMessageAck,
            PeerMessage::ReplicationStatus(_) => MessageKind::ReplicationStatus,
        }
    }

    pub fn decode(kind: MessageKind, payload: &Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageKind::Hello => PeerMessage::Hello(parse(payload)?),
            MessageKind::SyncState => PeerMessage::SyncState(parse(payload)?),
            MessageKind::ClientConnected => PeerMessage::ClientConnected(parse(payload)?),
            MessageKind::ClientDisconnected => PeerMessage::ClientDisconnected(parse(payload)?),
            MessageKind::ChannelMembership => PeerMessage::ChannelMembership(parse(payload)?),
            MessageKind::DirectMessage => PeerMessage::DirectMessage(parse(payload)?),
            MessageKind::ChannelMessage => PeerMessage::ChannelMessage(parse(payload)?),
            MessageKind::SessionMessage => PeerMessage::SessionMessage(parse(payload)?),
            MessageKind::Broadcast => PeerMessage::Broadcast(parse(payload)?),
            MessageKind::DirectMessageAck => PeerMessage::DirectMessageAck(parse(payload)?),
            MessageKind::ChannelMessageAck => PeerMessage::ChannelMessageAck(parse(payload)?),
            MessageKind::ReplicationStatus => PeerMessage::ReplicationStatus(parse(payload)?),
        })
    }

    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            PeerMessage::Hello(p) => serde_json::to_value(p),
            PeerMessage::SyncState(p) => serde_json::to_value(p),
            PeerMessage::ClientConnected(p) => serde_json::to_value(p),
            PeerMessage::ClientDisconnected(p) => serde_json::to_value(p),
            PeerMessage::ChannelMembership(p) => serde_json::to_value(p),
            PeerMessage::DirectMessage(p) => serde_json::to_value(p),
            PeerMessage::ChannelMessage(p) => serde_json::to_value(p),
            PeerMessage::SessionMessage(p) => serde_json::to_value(p),
            PeerMessage::Broadcast(p) => serde_json::to_value(p),
            PeerMessage::DirectMessageAck(p) | PeerMessage::ChannelMessageAck(p) => {
                serde_json::to_value(p)
            }
            PeerMessage::ReplicationStatus(p) => serde_json::to_value(p),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub instance_id: String,
}

/// A session connected to some node, as that node last reported it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSessionSnapshot {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub channels: BTreeSet<i64>,
    #[serde(default)]
    pub channel_uuids: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatePayload {
    /// Sessions per server, including servers that currently have none.
    #[serde(default)]
    pub servers: BTreeMap<String, Vec<RemoteSessionSnapshot>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDisconnection {
    pub session_id: String,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipAction {
    Join,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelUpdate {
    pub session_id: String,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub user_id: Option<i64>,
    pub channel_id: i64,
    #[serde(default)]
    pub channel_uuid: Option<String>,
    pub action: MembershipAction,
}

/// A message for a user on another node. The user is resolved there by
/// email, then username, and only then by numeric id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessagePayload {
    pub message_id: String,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub message: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessagePayload {
    pub message_id: String,
    #[serde(default)]
    pub channel_id: Option<i64>,
    #[serde(default)]
    pub channel_uuid: Option<String>,
    #[serde(default)]
    pub sender_id: Option<i64>,
    #[serde(default)]
    pub sender_email: Option<String>,
    pub message: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionForward {
    pub session_id: String,
    pub message: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastPayload {
    pub message: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub message_id: String,
    #[serde(default)]
    pub origin_server_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationStatusPayload {
    pub server_id: String,
    #[serde(default)]
    pub connected_peers: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, u64>,
    #[serde(default)]
    pub pending_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_wire_format() {
        let msg = PeerMessage::Hello(HelloPayload {
            server_id: "alpha".into(),
            instance_id: "i-1".into(),
        });
        let env = PeerEnvelope::new("alpha", &msg).unwrap();
        let line = env.to_line().unwrap();
        assert_eq!(
            line,
            r#"{"type":"HELLO","origin":"alpha","payload":{"instanceId":"i-1","serverId":"alpha"}}"#
        );
        let back = PeerEnvelope::from_line(&line).unwrap();
        assert_eq!(back.decode().unwrap(), msg);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = PeerEnvelope::from_line(r#"{"type":"NOPE","origin":"x","payload":{}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn malformed_payload_fails_decode_not_parse() {
        let env = PeerEnvelope::from_line(r#"{"type":"DIRECT_MESSAGE_ACK","origin":"x","payload":{"success":"yes"}}"#).unwrap();
        assert!(env.decode().is_err());
    }

    #[test]
    fn route_marking() {
        let mut env = PeerEnvelope::new("a", &PeerMessage::Broadcast(BroadcastPayload::default())).unwrap();
        assert!(env.mark_visited("node-a"));
        assert!(env.mark_visited("node-b"));
        assert!(!env.mark_visited("NODE-A"));
        assert!(env.has_visited("node-b"));
        assert!(!env.has_visited(""));
        assert_eq!(env.route, vec!["node-a", "node-b"]);
    }

    #[test]
    fn ack_error_is_optional() {
        let env = PeerEnvelope::from_line(
            r#"{"type":"CHANNEL_MESSAGE_ACK","origin":"b","target":" a ","payload":{"messageId":"a:1","originServerId":"b","success":true}}"#,
        )
        .unwrap();
        assert_eq!(env.target(), Some("a"));
        match env.decode().unwrap() {
            PeerMessage::ChannelMessageAck(ack) => {
                assert!(ack.success);
                assert_eq!(ack.error, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tracked_kinds() {
        assert_eq!(MessageKind::DirectMessage.ack_kind(), Some(MessageKind::DirectMessageAck));
        assert!(MessageKind::ChannelMessage.is_tracked());
        assert!(!MessageKind::Broadcast.is_tracked());
        assert_eq!(MessageKind::SyncState.to_string(), "SYNC_STATE");
    }
}
