//! Serializable bundles of replicable database state.
//!
//! Numeric ids in these records are the *sender's* local ids. They are only
//! meaningful together with the natural keys carried next to them: username
//! or email for users, UUID for channels.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSnapshot {
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub channels: Vec<ChannelRecord>,
    #[serde(default)]
    pub memberships: Vec<MembershipRecord>,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
    #[serde(default)]
    pub invitations: Vec<InvitationRecord>,
}

impl DatabaseSnapshot {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.channels.is_empty()
            && self.memberships.is_empty()
            && self.messages.is_empty()
            && self.invitations.is_empty()
    }

    /// Copy of this snapshot with every profile photo removed.
    pub fn without_photos(&self) -> Self {
        let mut stripped = self.clone();
        for user in &mut stripped.users {
            user.photo_base64 = None;
        }
        stripped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_base64: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    pub id: i64,
    /// Cluster-wide identity. Older peers may omit it.
    #[serde(default)]
    pub uuid: Option<String>,
    pub name: String,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipRecord {
    pub channel_id: i64,
    #[serde(default)]
    pub channel_uuid: Option<String>,
    pub user_id: i64,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: i64,
    /// RFC 3339.
    pub timestamp: String,
    pub kind: String,
    #[serde(default)]
    pub sender_id: Option<i64>,
    #[serde(default)]
    pub sender_email: Option<String>,
    #[serde(default)]
    pub receiver_id: Option<i64>,
    #[serde(default)]
    pub receiver_email: Option<String>,
    #[serde(default)]
    pub channel_id: Option<i64>,
    #[serde(default)]
    pub channel_uuid: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<i64>,
    #[serde(default)]
    pub transcript: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationRecord {
    pub id: i64,
    pub channel_id: i64,
    #[serde(default)]
    pub channel_uuid: Option<String>,
    pub inviter_id: i64,
    #[serde(default)]
    pub inviter_email: Option<String>,
    pub invitee_id: i64,
    #[serde(default)]
    pub invitee_email: Option<String>,
    /// RFC 3339.
    pub created_at: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_camel_case() {
        let snap = DatabaseSnapshot {
            users: vec![UserRecord {
                id: 1,
                username: "alice".into(),
                email: "alice@example.com".into(),
                photo_base64: Some("AAAA".into()),
                ..Default::default()
            }],
            memberships: vec![MembershipRecord {
                channel_id: 10,
                channel_uuid: Some("u1".into()),
                user_id: 1,
                ..Default::default()
            }],
            ..Default::default()
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["users"][0]["photoBase64"], "AAAA");
        assert_eq!(json["memberships"][0]["channelUuid"], "u1");
        assert!(!snap.is_empty());
        assert!(snap.without_photos().users[0].photo_base64.is_none());
    }

    #[test]
    fn missing_lists_default_to_empty() {
        let snap: DatabaseSnapshot = serde_json::from_str(r#"{"channels":[{"id":3,"name":"general"}]}"#).unwrap();
        assert_eq!(snap.channels[0].uuid, None);
        assert!(snap.users.is_empty());
        assert!(DatabaseSnapshot::default().is_empty());
    }
}
