//! Database snapshot capture and merge.
//!
//! A snapshot applies in a single transaction. Records are matched by their
//! cluster-wide natural keys (username/email for users, UUID for channels)
//! and every sender-local numeric id is translated through per-apply remap
//! tables before dependent records (memberships, messages, invitations) are
//! written. Applying the same snapshot twice leaves the store unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::DateTime;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{self, Channel, Db, Invitation, InvitationStatus, Message, User};
use crate::error::SyncError;
use crate::snapshot::{
    ChannelRecord, DatabaseSnapshot, InvitationRecord, MembershipRecord, MessageRecord, UserRecord,
};

/// A pending invitation that became known through a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedInvitation {
    pub invitation: Invitation,
    pub channel: Channel,
    pub invitee: User,
}

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// False when the snapshot was already fully reflected locally.
    pub changed: bool,
    pub new_invitations: Vec<ReceivedInvitation>,
}

pub struct StateSynchronizer {
    db: Arc<Mutex<Db>>,
    max_blob_bytes: usize,
}

impl StateSynchronizer {
    pub fn new(db: Db, max_blob_bytes: usize) -> Self {
        Self { db: Arc::new(Mutex::new(db)), max_blob_bytes }
    }

    /// Run a read/write closure against the store, logging failures.
    pub fn with_db<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&Db) -> rusqlite::Result<R>,
    {
        let db = self.db.lock();
        match f(&db) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::error!("Database error: {e}");
                None
            }
        }
    }

    // ── Capture ────────────────────────────────────────────────────────

    /// Full snapshot of all replicable state.
    pub fn capture_snapshot(&self) -> Result<DatabaseSnapshot, SyncError> {
        let db = self.db.lock();
        let users = db.all_users()?;
        let channels = db.all_channels()?;
        let user_keys: HashMap<i64, &User> = users.iter().map(|u| (u.id, u)).collect();
        let channel_uuids: HashMap<i64, &str> =
            channels.iter().map(|c| (c.id, c.uuid.as_str())).collect();

        let memberships = db
            .memberships()?
            .into_iter()
            .map(|(channel_id, user_id)| MembershipRecord {
                channel_id,
                channel_uuid: channel_uuids.get(&channel_id).map(|u| u.to_string()),
                user_id,
                user_email: user_keys.get(&user_id).map(|u| u.email.clone()),
                username: user_keys.get(&user_id).map(|u| u.username.clone()),
            })
            .collect();

        let messages = db
            .all_messages()?
            .into_iter()
            .map(|m| message_record(&m, &user_keys, &channel_uuids))
            .collect();

        let invitations = db
            .all_invitations()?
            .into_iter()
            .map(|i| invitation_record(&i, &user_keys, &channel_uuids))
            .collect();

        Ok(DatabaseSnapshot {
            users: users.iter().map(user_record).collect(),
            channels: channels.iter().map(channel_record).collect(),
            memberships,
            messages,
            invitations,
        })
    }

    /// Incremental snapshot for a newly registered user.
    pub fn user_snapshot(&self, user_id: i64) -> Result<Option<DatabaseSnapshot>, SyncError> {
        let db = self.db.lock();
        let Some(user) = db.user_by_id(user_id)? else {
            return Ok(None);
        };
        Ok(Some(DatabaseSnapshot { users: vec![user_record(&user)], ..Default::default() }))
    }

    /// Incremental snapshot for a channel with all of its members.
    pub fn channel_snapshot(&self, channel_id: i64) -> Result<Option<DatabaseSnapshot>, SyncError> {
        let db = self.db.lock();
        let Some(channel) = db.channel_by_id(channel_id)? else {
            return Ok(None);
        };
        let members = db.channel_members(channel_id)?;
        Ok(Some(DatabaseSnapshot {
            memberships: members.iter().map(|u| membership_record(&channel, u)).collect(),
            users: members.iter().map(user_record).collect(),
            channels: vec![channel_record(&channel)],
            ..Default::default()
        }))
    }

    /// Incremental snapshot for one user joining one channel.
    pub fn membership_snapshot(
        &self,
        channel_id: i64,
        user_id: i64,
    ) -> Result<Option<DatabaseSnapshot>, SyncError> {
        let db = self.db.lock();
        let (Some(channel), Some(user)) = (db.channel_by_id(channel_id)?, db.user_by_id(user_id)?) else {
            return Ok(None);
        };
        Ok(Some(DatabaseSnapshot {
            users: vec![user_record(&user)],
            channels: vec![channel_record(&channel)],
            memberships: vec![membership_record(&channel, &user)],
            ..Default::default()
        }))
    }

    /// Incremental snapshot for the invitation of `invitee_id` to `channel_id`.
    pub fn invitation_snapshot(
        &self,
        channel_id: i64,
        invitee_id: i64,
    ) -> Result<Option<DatabaseSnapshot>, SyncError> {
        let db = self.db.lock();
        let Some(invitation) = db::invitation_for(db.conn(), channel_id, invitee_id)? else {
            return Ok(None);
        };
        let Some(channel) = db.channel_by_id(channel_id)? else {
            return Ok(None);
        };
        let mut users = Vec::new();
        for id in [invitation.inviter_id, invitation.invitee_id] {
            if let Some(u) = db.user_by_id(id)? {
                users.push(u);
            }
        }
        let keys: HashMap<i64, &User> = users.iter().map(|u| (u.id, u)).collect();
        let uuids = HashMap::from([(channel.id, channel.uuid.as_str())]);
        Ok(Some(DatabaseSnapshot {
            invitations: vec![invitation_record(&invitation, &keys, &uuids)],
            users: users.iter().map(user_record).collect(),
            channels: vec![channel_record(&channel)],
            ..Default::default()
        }))
    }

    // ── Apply ──────────────────────────────────────────────────────────

    /// Merge a received snapshot into the local store.
    ///
    /// All-or-nothing: any database error rolls the whole apply back. An
    /// oversized profile photo is the one exception; the apply is retried
    /// once with photos left out.
    pub fn apply_snapshot(&self, snapshot: &DatabaseSnapshot) -> Result<ApplyOutcome, SyncError> {
        if snapshot.is_empty() {
            return Ok(ApplyOutcome::default());
        }
        match self.apply_once(snapshot) {
            Err(e) if e.is_oversized() => {
                tracing::warn!("Snapshot field too large ({e}), retrying without photos");
                self.apply_once(&snapshot.without_photos())
            }
            other => other,
        }
    }

    fn apply_once(&self, snapshot: &DatabaseSnapshot) -> Result<ApplyOutcome, SyncError> {
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        let outcome = {
            let mut merge = Merge::new(&tx, self.max_blob_bytes);
            for user in &snapshot.users {
                merge.user(user)?;
            }
            for channel in &snapshot.channels {
                merge.channel(channel)?;
            }
            for membership in &snapshot.memberships {
                merge.membership(membership)?;
            }
            for message in &snapshot.messages {
                merge.message(message)?;
            }
            for invitation in &snapshot.invitations {
                merge.invitation(invitation)?;
            }
            merge.outcome
        };
        tx.commit()?;
        if outcome.changed {
            tracing::debug!(
                users = snapshot.users.len(),
                channels = snapshot.channels.len(),
                messages = snapshot.messages.len(),
                "Applied database snapshot"
            );
        }
        Ok(outcome)
    }

    // ── Lookups for message delivery ───────────────────────────────────

    /// Local id of a user known by email or username.
    pub fn local_user_id(&self, email: Option<&str>, username: Option<&str>) -> Option<i64> {
        self.with_db(|db| {
            if let Some(email) = email.filter(|e| !e.trim().is_empty()) {
                if let Some(u) = db.user_by_email(email)? {
                    return Ok(Some(u.id));
                }
            }
            if let Some(name) = username.filter(|n| !n.trim().is_empty()) {
                if let Some(u) = db.user_by_username(name)? {
                    return Ok(Some(u.id));
                }
            }
            Ok(None)
        })
        .flatten()
    }

    pub fn channel_by_uuid(&self, uuid: &str) -> Option<Channel> {
        self.with_db(|db| db.channel_by_uuid(uuid)).flatten()
    }

    pub fn channel_by_id(&self, id: i64) -> Option<Channel> {
        self.with_db(|db| db.channel_by_id(id)).flatten()
    }

    pub fn user_by_id(&self, id: i64) -> Option<User> {
        self.with_db(|db| db.user_by_id(id)).flatten()
    }

    /// Set a user's online flag, locating them by email then username.
    /// Returns true if a row changed.
    pub fn apply_user_status(
        &self,
        email: Option<&str>,
        username: Option<&str>,
        online: bool,
    ) -> Result<bool, SyncError> {
        let Some(id) = self.local_user_id(email, username) else {
            return Ok(false);
        };
        Ok(self.db.lock().set_online(id, online)?)
    }
}

/// Per-apply merge state. Remap tables translate the sender's ids.
struct Merge<'a> {
    conn: &'a Connection,
    max_blob_bytes: usize,
    users: HashMap<i64, i64>,
    channels: HashMap<i64, i64>,
    outcome: ApplyOutcome,
}

/// A reference to a user or channel in a dependent record.
enum Ref {
    Absent,
    Local(i64),
    Unresolved,
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

impl<'a> Merge<'a> {
    fn new(conn: &'a Connection, max_blob_bytes: usize) -> Self {
        Self {
            conn,
            max_blob_bytes,
            users: HashMap::new(),
            channels: HashMap::new(),
            outcome: ApplyOutcome::default(),
        }
    }

    fn id_is_free(&self, table: &str, id: i64) -> Result<bool, SyncError> {
        if id <= 0 {
            return Ok(false);
        }
        let taken: Option<i64> = self
            .conn
            .query_row(&format!("SELECT id FROM {table} WHERE id = ?1"), params![id], |r| r.get(0))
            .optional()?;
        Ok(taken.is_none())
    }

    fn photo(&self, rec: &UserRecord) -> Result<Option<Vec<u8>>, SyncError> {
        let Some(encoded) = non_blank(rec.photo_base64.as_deref()) else {
            return Ok(None);
        };
        let bytes = match BASE64.decode(encoded) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(user = %rec.username, "Ignoring undecodable photo: {e}");
                return Ok(None);
            }
        };
        if bytes.len() > self.max_blob_bytes {
            return Err(SyncError::FieldTooLarge {
                field: "photo",
                size: bytes.len(),
                limit: self.max_blob_bytes,
            });
        }
        Ok(Some(bytes))
    }

    fn user(&mut self, rec: &UserRecord) -> Result<(), SyncError> {
        let username = rec.username.trim();
        let email = rec.email.trim();
        if username.is_empty() && email.is_empty() {
            return Ok(());
        }
        let photo = self.photo(rec)?;
        let ip = non_blank(rec.ip.as_deref());

        let mut existing = None;
        if !username.is_empty() {
            existing = db::user_by_username(self.conn, username)?;
        }
        if existing.is_none() && !email.is_empty() {
            existing = db::user_by_email(self.conn, email)?;
        }

        if let Some(local) = existing {
            let n = self.conn.execute(
                "UPDATE users SET
                    password = COALESCE(?2, password),
                    photo = COALESCE(?3, photo),
                    ip = COALESCE(?4, ip)
                 WHERE id = ?1 AND (
                    password IS NOT COALESCE(?2, password)
                    OR photo IS NOT COALESCE(?3, photo)
                    OR ip IS NOT COALESCE(?4, ip))",
                params![local.id, rec.password, photo, ip],
            )?;
            self.outcome.changed |= n > 0;
            // natural keys move only when the new value is free
            if !username.is_empty() && local.username != username {
                let n = self.conn.execute(
                    "UPDATE users SET username = ?2 WHERE id = ?1
                     AND NOT EXISTS (SELECT 1 FROM users WHERE username = ?2 COLLATE NOCASE)",
                    params![local.id, username],
                )?;
                self.outcome.changed |= n > 0;
            }
            if !email.is_empty() && !local.email.eq_ignore_ascii_case(email) {
                let n = self.conn.execute(
                    "UPDATE users SET email = ?2 WHERE id = ?1
                     AND NOT EXISTS (SELECT 1 FROM users WHERE email = ?2 COLLATE NOCASE)",
                    params![local.id, email],
                )?;
                self.outcome.changed |= n > 0;
            }
            self.users.insert(rec.id, local.id);
            return Ok(());
        }

        if username.is_empty() || email.is_empty() {
            tracing::debug!(id = rec.id, "Skipping user record without username or email");
            return Ok(());
        }
        let local_id = if self.id_is_free("users", rec.id)? {
            self.conn.execute(
                "INSERT INTO users (id, username, email, password, photo, ip, online)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![rec.id, username, email, rec.password, photo, ip, rec.online],
            )?;
            rec.id
        } else {
            self.conn.execute(
                "INSERT INTO users (username, email, password, photo, ip, online)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![username, email, rec.password, photo, ip, rec.online],
            )?;
            let id = self.conn.last_insert_rowid();
            tracing::debug!(remote_id = rec.id, local_id = id, user = %username, "Remapped user id");
            id
        };
        self.users.insert(rec.id, local_id);
        self.outcome.changed = true;
        Ok(())
    }

    fn channel(&mut self, rec: &ChannelRecord) -> Result<(), SyncError> {
        let uuid = non_blank(rec.uuid.as_deref());
        let existing = match uuid {
            Some(uuid) => db::channel_by_uuid(self.conn, uuid)?,
            // without a UUID: same id under the same name, else the oldest channel of that name
            None => match db::channel_by_id(self.conn, rec.id)?.filter(|c| c.name == rec.name) {
                Some(c) => Some(c),
                None => db::channel_by_name(self.conn, &rec.name)?,
            },
        };

        if let Some(local) = existing {
            let n = self.conn.execute(
                "UPDATE channels SET name = ?2, private = ?3
                 WHERE id = ?1 AND (name IS NOT ?2 OR private IS NOT ?3)",
                params![local.id, rec.name, rec.private],
            )?;
            self.outcome.changed |= n > 0;
            self.channels.insert(rec.id, local.id);
            return Ok(());
        }

        let uuid = uuid.map(str::to_string).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let local_id = if self.id_is_free("channels", rec.id)? {
            self.conn.execute(
                "INSERT INTO channels (id, uuid, name, private) VALUES (?1, ?2, ?3, ?4)",
                params![rec.id, uuid, rec.name, rec.private],
            )?;
            rec.id
        } else {
            self.conn.execute(
                "INSERT INTO channels (uuid, name, private) VALUES (?1, ?2, ?3)",
                params![uuid, rec.name, rec.private],
            )?;
            self.conn.last_insert_rowid()
        };
        tracing::debug!(remote_id = rec.id, local_id, uuid = %uuid, "Merged new channel");
        self.channels.insert(rec.id, local_id);
        self.outcome.changed = true;
        Ok(())
    }

    fn resolve_user(&self, email: Option<&str>, username: Option<&str>, id: Option<i64>) -> Result<Ref, SyncError> {
        if let Some(email) = non_blank(email) {
            if let Some(u) = db::user_by_email(self.conn, email)? {
                return Ok(Ref::Local(u.id));
            }
        }
        if let Some(name) = non_blank(username) {
            if let Some(u) = db::user_by_username(self.conn, name)? {
                return Ok(Ref::Local(u.id));
            }
        }
        Ok(match id {
            Some(id) => self.users.get(&id).map_or(Ref::Unresolved, |l| Ref::Local(*l)),
            None if non_blank(email).is_some() || non_blank(username).is_some() => Ref::Unresolved,
            None => Ref::Absent,
        })
    }

    fn resolve_channel(&self, uuid: Option<&str>, id: Option<i64>) -> Result<Ref, SyncError> {
        if let Some(uuid) = non_blank(uuid) {
            return Ok(match db::channel_by_uuid(self.conn, uuid)? {
                Some(c) => Ref::Local(c.id),
                None => Ref::Unresolved,
            });
        }
        Ok(match id {
            Some(id) => self.channels.get(&id).map_or(Ref::Unresolved, |l| Ref::Local(*l)),
            None => Ref::Absent,
        })
    }

    fn membership(&mut self, rec: &MembershipRecord) -> Result<(), SyncError> {
        let Ref::Local(channel_id) = self.resolve_channel(rec.channel_uuid.as_deref(), Some(rec.channel_id))? else {
            tracing::debug!(channel = rec.channel_id, "Skipping membership for unknown channel");
            return Ok(());
        };
        let Ref::Local(user_id) =
            self.resolve_user(rec.user_email.as_deref(), rec.username.as_deref(), Some(rec.user_id))?
        else {
            tracing::debug!(user = rec.user_id, "Skipping membership for unknown user");
            return Ok(());
        };
        self.outcome.changed |= db::add_member(self.conn, channel_id, user_id)?;
        Ok(())
    }

    fn message(&mut self, rec: &MessageRecord) -> Result<(), SyncError> {
        let sender = self.resolve_user(rec.sender_email.as_deref(), None, rec.sender_id)?;
        let receiver = self.resolve_user(rec.receiver_email.as_deref(), None, rec.receiver_id)?;
        let channel = self.resolve_channel(rec.channel_uuid.as_deref(), rec.channel_id)?;
        let column = |r: Ref| match r {
            Ref::Absent => Some(None),
            Ref::Local(id) => Some(Some(id)),
            Ref::Unresolved => None,
        };
        let (Some(sender_id), Some(receiver_id), Some(channel_id)) =
            (column(sender), column(receiver), column(channel))
        else {
            tracing::debug!(id = rec.id, "Skipping message with unresolved references");
            return Ok(());
        };

        let duplicate: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM messages
                 WHERE timestamp = ?1 AND kind = ?2 AND sender_id IS ?3
                   AND receiver_id IS ?4 AND channel_id IS ?5 AND content IS ?6
                   AND file_path IS ?7
                 LIMIT 1",
                params![rec.timestamp, rec.kind, sender_id, receiver_id, channel_id, rec.content, rec.file_path],
                |r| r.get(0),
            )
            .optional()?;
        if duplicate.is_some() {
            return Ok(());
        }
        db::insert_message(
            self.conn,
            &Message {
                id: 0,
                timestamp: rec.timestamp.clone(),
                kind: rec.kind.clone(),
                sender_id,
                receiver_id,
                channel_id,
                content: rec.content.clone(),
                file_path: rec.file_path.clone(),
                mime: rec.mime.clone(),
                duration_secs: rec.duration_secs,
                transcript: rec.transcript.clone(),
            },
        )?;
        self.outcome.changed = true;
        Ok(())
    }

    fn invitation(&mut self, rec: &InvitationRecord) -> Result<(), SyncError> {
        let (Ref::Local(channel_id), Ref::Local(inviter_id), Ref::Local(invitee_id)) = (
            self.resolve_channel(rec.channel_uuid.as_deref(), Some(rec.channel_id))?,
            self.resolve_user(rec.inviter_email.as_deref(), None, Some(rec.inviter_id))?,
            self.resolve_user(rec.invitee_email.as_deref(), None, Some(rec.invitee_id))?,
        ) else {
            tracing::debug!(id = rec.id, "Skipping invitation with unresolved references");
            return Ok(());
        };
        let status = InvitationStatus::parse(&rec.status).unwrap_or(InvitationStatus::Pending);
        let created_at = if rec.created_at.trim().is_empty() { db::now_rfc3339() } else { rec.created_at.clone() };

        let notify = match db::invitation_for(self.conn, channel_id, invitee_id)? {
            None => {
                self.conn.execute(
                    "INSERT INTO invitations (channel_id, inviter_id, invitee_id, created_at, status)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![channel_id, inviter_id, invitee_id, created_at, status.as_str()],
                )?;
                status == InvitationStatus::Pending
            }
            Some(local) => {
                let reinvite = is_newer(&created_at, &local.created_at);
                // same invitation: only a pending one may be answered
                let answered = !reinvite && local.status == InvitationStatus::Pending && status != local.status;
                if !reinvite && !answered {
                    return Ok(());
                }
                self.conn.execute(
                    "UPDATE invitations SET inviter_id = ?2, created_at = ?3, status = ?4 WHERE id = ?1",
                    params![local.id, inviter_id, created_at, status.as_str()],
                )?;
                reinvite && status == InvitationStatus::Pending
            }
        };
        self.outcome.changed = true;

        if notify {
            let invitation = db::invitation_for(self.conn, channel_id, invitee_id)?;
            let channel = db::channel_by_id(self.conn, channel_id)?;
            let invitee = db::user_by_id(self.conn, invitee_id)?;
            if let (Some(invitation), Some(channel), Some(invitee)) = (invitation, channel, invitee) {
                self.outcome.new_invitations.push(ReceivedInvitation { invitation, channel, invitee });
            }
        }
        Ok(())
    }
}

/// True if RFC 3339 timestamp `a` is strictly later than `b`.
fn is_newer(a: &str, b: &str) -> bool {
    match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
        (Ok(a), Ok(b)) => a > b,
        _ => a > b,
    }
}

// ── Record conversion ──────────────────────────────────────────────────

fn user_record(u: &User) -> UserRecord {
    UserRecord {
        id: u.id,
        username: u.username.clone(),
        email: u.email.clone(),
        password: u.password.clone(),
        photo_base64: u.photo.as_deref().filter(|p| !p.is_empty()).map(|p| BASE64.encode(p)),
        ip: u.ip.clone(),
        online: u.online,
    }
}

fn channel_record(c: &Channel) -> ChannelRecord {
    ChannelRecord { id: c.id, uuid: Some(c.uuid.clone()), name: c.name.clone(), private: c.private }
}

fn membership_record(c: &Channel, u: &User) -> MembershipRecord {
    MembershipRecord {
        channel_id: c.id,
        channel_uuid: Some(c.uuid.clone()),
        user_id: u.id,
        user_email: Some(u.email.clone()),
        username: Some(u.username.clone()),
    }
}

fn message_record(m: &Message, users: &HashMap<i64, &User>, uuids: &HashMap<i64, &str>) -> MessageRecord {
    let email = |id: Option<i64>| id.and_then(|id| users.get(&id)).map(|u| u.email.clone());
    MessageRecord {
        id: m.id,
        timestamp: m.timestamp.clone(),
        kind: m.kind.clone(),
        sender_id: m.sender_id,
        sender_email: email(m.sender_id),
        receiver_id: m.receiver_id,
        receiver_email: email(m.receiver_id),
        channel_id: m.channel_id,
        channel_uuid: m.channel_id.and_then(|id| uuids.get(&id)).map(|u| u.to_string()),
        content: m.content.clone(),
        file_path: m.file_path.clone(),
        mime: m.mime.clone(),
        duration_secs: m.duration_secs,
        transcript: m.transcript.clone(),
    }
}

fn invitation_record(i: &Invitation, users: &HashMap<i64, &User>, uuids: &HashMap<i64, &str>) -> InvitationRecord {
    InvitationRecord {
        id: i.id,
        channel_id: i.channel_id,
        channel_uuid: uuids.get(&i.channel_id).map(|u| u.to_string()),
        inviter_id: i.inviter_id,
        inviter_email: users.get(&i.inviter_id).map(|u| u.email.clone()),
        invitee_id: i.invitee_id,
        invitee_email: users.get(&i.invitee_id).map(|u| u.email.clone()),
        created_at: i.created_at.clone(),
        status: i.status.as_str().to_string(),
    }
}
