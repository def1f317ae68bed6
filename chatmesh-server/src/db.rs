//! SQLite persistence layer.
//!
//! Stores users, channels and their memberships, messages and channel
//! invitations. Uses WAL mode for concurrent reads during writes.
//!
//! Numeric ids are local to this node. Users are identified across the
//! cluster by username or email and channels by their UUID.

use std::path::Path;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row, Transaction};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password: Option<String>,
    pub photo: Option<Vec<u8>>,
    pub ip: Option<String>,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub private: bool,
}

pub const TEXT: &str = "TEXT";
pub const AUDIO: &str = "AUDIO";
pub const FILE: &str = "FILE";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub id: i64,
    /// RFC 3339.
    pub timestamp: String,
    /// One of [`TEXT`], [`AUDIO`] or [`FILE`].
    pub kind: String,
    pub sender_id: Option<i64>,
    pub receiver_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub content: Option<String>,
    pub file_path: Option<String>,
    pub mime: Option<String>,
    pub duration_secs: Option<i64>,
    pub transcript: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Rejected,
}

impl InvitationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvitationStatus::Pending => "PENDING",
            InvitationStatus::Accepted => "ACCEPTED",
            InvitationStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(InvitationStatus::Pending),
            "ACCEPTED" => Some(InvitationStatus::Accepted),
            "REJECTED" => Some(InvitationStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invitation {
    pub id: i64,
    pub channel_id: i64,
    pub inviter_id: i64,
    pub invitee_id: i64,
    /// RFC 3339.
    pub created_at: String,
    pub status: InvitationStatus,
}

/// Current time in the format stored in timestamp columns.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing and diskless nodes).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id        INTEGER PRIMARY KEY,
                username  TEXT NOT NULL UNIQUE,
                email     TEXT NOT NULL UNIQUE,
                password  TEXT,
                photo     BLOB,
                ip        TEXT,
                online    INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS channels (
                id       INTEGER PRIMARY KEY,
                uuid     TEXT NOT NULL UNIQUE,
                name     TEXT NOT NULL,
                private  INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS channel_members (
                channel_id  INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                user_id     INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                PRIMARY KEY (channel_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id             INTEGER PRIMARY KEY,
                timestamp      TEXT NOT NULL,
                kind           TEXT NOT NULL,
                sender_id      INTEGER,
                receiver_id    INTEGER,
                channel_id     INTEGER,
                content        TEXT,
                file_path      TEXT,
                mime           TEXT,
                duration_secs  INTEGER,
                transcript     TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(timestamp);

            CREATE TABLE IF NOT EXISTS invitations (
                id          INTEGER PRIMARY KEY,
                channel_id  INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                inviter_id  INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                invitee_id  INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at  TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'PENDING',
                UNIQUE(channel_id, invitee_id)
            );
            ",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a unit of work. Dropping the transaction without committing
    /// rolls it back.
    pub fn transaction(&mut self) -> SqlResult<Transaction<'_>> {
        self.conn.transaction()
    }

    // ── Users ──────────────────────────────────────────────────────────

    /// Register a user, returning the new local id.
    pub fn insert_user(
        &self,
        username: &str,
        email: &str,
        password: Option<&str>,
        ip: Option<&str>,
    ) -> SqlResult<i64> {
        self.conn.execute(
            "INSERT INTO users (username, email, password, ip) VALUES (?1, ?2, ?3, ?4)",
            params![username, email, password, ip],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_user_photo(&self, user_id: i64, photo: Option<&[u8]>) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE users SET photo = ?2 WHERE id = ?1",
            params![user_id, photo],
        )?;
        Ok(())
    }

    /// Returns true if the flag actually changed.
    pub fn set_online(&self, user_id: i64, online: bool) -> SqlResult<bool> {
        let n = self.conn.execute(
            "UPDATE users SET online = ?2 WHERE id = ?1 AND online IS NOT ?2",
            params![user_id, online],
        )?;
        Ok(n > 0)
    }

    pub fn user_by_id(&self, id: i64) -> SqlResult<Option<User>> {
        user_by_id(&self.conn, id)
    }

    pub fn user_by_username(&self, username: &str) -> SqlResult<Option<User>> {
        user_by_username(&self.conn, username)
    }

    pub fn user_by_email(&self, email: &str) -> SqlResult<Option<User>> {
        user_by_email(&self.conn, email)
    }

    pub fn all_users(&self) -> SqlResult<Vec<User>> {
        let mut stmt = self.conn.prepare(&format!("{USER_COLUMNS} ORDER BY id"))?;
        let rows = stmt.query_map([], map_user_row)?;
        rows.collect()
    }

    // ── Channels ───────────────────────────────────────────────────────

    /// Create a channel with a freshly generated UUID.
    pub fn create_channel(&self, name: &str, private: bool) -> SqlResult<Channel> {
        let uuid = uuid::Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO channels (uuid, name, private) VALUES (?1, ?2, ?3)",
            params![uuid, name, private],
        )?;
        Ok(Channel { id: self.conn.last_insert_rowid(), uuid, name: name.to_string(), private })
    }

    pub fn channel_by_id(&self, id: i64) -> SqlResult<Option<Channel>> {
        channel_by_id(&self.conn, id)
    }

    pub fn channel_by_uuid(&self, uuid: &str) -> SqlResult<Option<Channel>> {
        channel_by_uuid(&self.conn, uuid)
    }

    pub fn all_channels(&self) -> SqlResult<Vec<Channel>> {
        let mut stmt = self.conn.prepare("SELECT id, uuid, name, private FROM channels ORDER BY id")?;
        let rows = stmt.query_map([], map_channel_row)?;
        rows.collect()
    }

    /// Returns true if the membership is new.
    pub fn add_member(&self, channel_id: i64, user_id: i64) -> SqlResult<bool> {
        add_member(&self.conn, channel_id, user_id)
    }

    pub fn remove_member(&self, channel_id: i64, user_id: i64) -> SqlResult<bool> {
        let n = self.conn.execute(
            "DELETE FROM channel_members WHERE channel_id = ?1 AND user_id = ?2",
            params![channel_id, user_id],
        )?;
        Ok(n > 0)
    }

    pub fn channel_members(&self, channel_id: i64) -> SqlResult<Vec<User>> {
        channel_members(&self.conn, channel_id)
    }

    /// All `(channel_id, user_id)` pairs.
    pub fn memberships(&self) -> SqlResult<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT channel_id, user_id FROM channel_members ORDER BY channel_id, user_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    // ── Messages ───────────────────────────────────────────────────────

    /// Store a message, returning its local id. `message.id` is ignored.
    pub fn insert_message(&self, message: &Message) -> SqlResult<i64> {
        insert_message(&self.conn, message)
    }

    /// All messages, oldest first.
    pub fn all_messages(&self) -> SqlResult<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, kind, sender_id, receiver_id, channel_id, content,
                    file_path, mime, duration_secs, transcript
             FROM messages ORDER BY id",
        )?;
        let rows = stmt.query_map([], map_message_row)?;
        rows.collect()
    }

    // ── Invitations ────────────────────────────────────────────────────

    pub fn create_invitation(
        &self,
        channel_id: i64,
        inviter_id: i64,
        invitee_id: i64,
    ) -> SqlResult<Invitation> {
        let created_at = now_rfc3339();
        self.conn.execute(
            "INSERT INTO invitations (channel_id, inviter_id, invitee_id, created_at, status)
             VALUES (?1, ?2, ?3, ?4, 'PENDING')
             ON CONFLICT(channel_id, invitee_id) DO UPDATE SET
                inviter_id = excluded.inviter_id,
                created_at = excluded.created_at,
                status = 'PENDING'",
            params![channel_id, inviter_id, invitee_id, created_at],
        )?;
        invitation_for(&self.conn, channel_id, invitee_id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    pub fn set_invitation_status(&self, id: i64, status: InvitationStatus) -> SqlResult<bool> {
        let n = self.conn.execute(
            "UPDATE invitations SET status = ?2 WHERE id = ?1 AND status IS NOT ?2",
            params![id, status.as_str()],
        )?;
        Ok(n > 0)
    }

    pub fn all_invitations(&self) -> SqlResult<Vec<Invitation>> {
        let mut stmt = self.conn.prepare(&format!("{INVITATION_COLUMNS} ORDER BY id"))?;
        let rows = stmt.query_map([], map_invitation_row)?;
        rows.collect()
    }

    pub fn pending_invitations_for(&self, invitee_id: i64) -> SqlResult<Vec<Invitation>> {
        let mut stmt = self.conn.prepare(&format!(
            "{INVITATION_COLUMNS} WHERE invitee_id = ?1 AND status = 'PENDING' ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![invitee_id], map_invitation_row)?;
        rows.collect()
    }
}

// ── Connection-level queries (shared with snapshot merge) ──────────────

const USER_COLUMNS: &str = "SELECT id, username, email, password, photo, ip, online FROM users";
const INVITATION_COLUMNS: &str =
    "SELECT id, channel_id, inviter_id, invitee_id, created_at, status FROM invitations";

pub(crate) fn user_by_id(conn: &Connection, id: i64) -> SqlResult<Option<User>> {
    conn.query_row(&format!("{USER_COLUMNS} WHERE id = ?1"), params![id], map_user_row)
        .optional()
}

pub(crate) fn user_by_username(conn: &Connection, username: &str) -> SqlResult<Option<User>> {
    conn.query_row(
        &format!("{USER_COLUMNS} WHERE username = ?1 COLLATE NOCASE"),
        params![username.trim()],
        map_user_row,
    )
    .optional()
}

pub(crate) fn user_by_email(conn: &Connection, email: &str) -> SqlResult<Option<User>> {
    conn.query_row(
        &format!("{USER_COLUMNS} WHERE email = ?1 COLLATE NOCASE"),
        params![email.trim()],
        map_user_row,
    )
    .optional()
}

pub(crate) fn channel_by_id(conn: &Connection, id: i64) -> SqlResult<Option<Channel>> {
    conn.query_row(
        "SELECT id, uuid, name, private FROM channels WHERE id = ?1",
        params![id],
        map_channel_row,
    )
    .optional()
}

/// Oldest channel with this exact name.
pub(crate) fn channel_by_name(conn: &Connection, name: &str) -> SqlResult<Option<Channel>> {
    conn.query_row(
        "SELECT id, uuid, name, private FROM channels WHERE name = ?1 ORDER BY id LIMIT 1",
        params![name],
        map_channel_row,
    )
    .optional()
}

pub(crate) fn channel_by_uuid(conn: &Connection, uuid: &str) -> SqlResult<Option<Channel>> {
    conn.query_row(
        "SELECT id, uuid, name, private FROM channels WHERE uuid = ?1",
        params![uuid.trim()],
        map_channel_row,
    )
    .optional()
}

pub(crate) fn channel_members(conn: &Connection, channel_id: i64) -> SqlResult<Vec<User>> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.username, u.email, u.password, u.photo, u.ip, u.online
         FROM channel_members m JOIN users u ON u.id = m.user_id
         WHERE m.channel_id = ?1 ORDER BY u.id",
    )?;
    let rows = stmt.query_map(params![channel_id], map_user_row)?;
    rows.collect()
}

pub(crate) fn add_member(conn: &Connection, channel_id: i64, user_id: i64) -> SqlResult<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO channel_members (channel_id, user_id) VALUES (?1, ?2)",
        params![channel_id, user_id],
    )?;
    Ok(n > 0)
}

pub(crate) fn insert_message(conn: &Connection, m: &Message) -> SqlResult<i64> {
    conn.execute(
        "INSERT INTO messages (timestamp, kind, sender_id, receiver_id, channel_id, content,
                               file_path, mime, duration_secs, transcript)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            m.timestamp,
            m.kind,
            m.sender_id,
            m.receiver_id,
            m.channel_id,
            m.content,
            m.file_path,
            m.mime,
            m.duration_secs,
            m.transcript,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn invitation_for(
    conn: &Connection,
    channel_id: i64,
    invitee_id: i64,
) -> SqlResult<Option<Invitation>> {
    conn.query_row(
        &format!("{INVITATION_COLUMNS} WHERE channel_id = ?1 AND invitee_id = ?2"),
        params![channel_id, invitee_id],
        map_invitation_row,
    )
    .optional()
}

fn map_user_row(row: &Row) -> SqlResult<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password: row.get(3)?,
        photo: row.get(4)?,
        ip: row.get(5)?,
        online: row.get(6)?,
    })
}

fn map_channel_row(row: &Row) -> SqlResult<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        uuid: row.get(1)?,
        name: row.get(2)?,
        private: row.get(3)?,
    })
}

fn map_message_row(row: &Row) -> SqlResult<Message> {
    Ok(Message {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        kind: row.get(2)?,
        sender_id: row.get(3)?,
        receiver_id: row.get(4)?,
        channel_id: row.get(5)?,
        content: row.get(6)?,
        file_path: row.get(7)?,
        mime: row.get(8)?,
        duration_secs: row.get(9)?,
        transcript: row.get(10)?,
    })
}

pub(crate) fn map_invitation_row(row: &Row) -> SqlResult<Invitation> {
    let status: String = row.get(5)?;
    Ok(Invitation {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        inviter_id: row.get(2)?,
        invitee_id: row.get(3)?,
        created_at: row.get(4)?,
        // unknown values from newer peers read as pending
        status: InvitationStatus::parse(&status).unwrap_or(InvitationStatus::Pending),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_users() {
        let db = Db::open_memory().unwrap();
        let id = db.insert_user("alice", "alice@example.com", Some("hash"), None).unwrap();
        db.set_user_photo(id, Some(&[1, 2, 3])).unwrap();

        let u = db.user_by_email("ALICE@example.com").unwrap().unwrap();
        assert_eq!(u.id, id);
        assert_eq!(u.username, "alice");
        assert_eq!(u.photo.as_deref(), Some(&[1u8, 2, 3][..]));
        assert!(!u.online);

        assert!(db.set_online(id, true).unwrap());
        assert!(!db.set_online(id, true).unwrap(), "no-op update reports no change");
        assert!(db.user_by_username("alice").unwrap().unwrap().online);
        assert!(db.user_by_id(999).unwrap().is_none());
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");
        let uuid = {
            let db = Db::open(&path).unwrap();
            let id = db.insert_user("carol", "carol@example.com", None, None).unwrap();
            let channel = db.create_channel("general", false).unwrap();
            db.add_member(channel.id, id).unwrap();
            channel.uuid
        };
        let db = Db::open(&path).unwrap();
        let channel = db.all_channels().unwrap().into_iter().find(|c| c.uuid == uuid).unwrap();
        assert_eq!(channel.name, "general");
        assert_eq!(db.channel_members(channel.id).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_username_rejected() {
        let db = Db::open_memory().unwrap();
        db.insert_user("bob", "bob@example.com", None, None).unwrap();
        assert!(db.insert_user("bob", "other@example.com", None, None).is_err());
    }

    #[test]
    fn channels_and_members() {
        let db = Db::open_memory().unwrap();
        let alice = db.insert_user("alice", "alice@example.com", None, None).unwrap();
        let general = db.create_channel("general", false).unwrap();
        assert_eq!(general.uuid.len(), 36);

        assert!(db.add_member(general.id, alice).unwrap());
        assert!(!db.add_member(general.id, alice).unwrap());
        let members = db.channel_members(general.id).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].username, "alice");

        assert_eq!(db.channel_by_uuid(&general.uuid).unwrap().unwrap().id, general.id);
        assert!(db.remove_member(general.id, alice).unwrap());
        assert!(db.memberships().unwrap().is_empty());
    }

    #[test]
    fn roundtrip_messages() {
        let db = Db::open_memory().unwrap();
        let alice = db.insert_user("alice", "alice@example.com", None, None).unwrap();
        let msg = Message {
            timestamp: now_rfc3339(),
            kind: TEXT.to_string(),
            sender_id: Some(alice),
            content: Some("hi".to_string()),
            ..Default::default()
        };
        let id = db.insert_message(&msg).unwrap();
        let all = db.all_messages().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
        assert_eq!(all[0].content.as_deref(), Some("hi"));
        assert_eq!(all[0].receiver_id, None);
    }

    #[test]
    fn invitation_lifecycle() {
        let db = Db::open_memory().unwrap();
        let alice = db.insert_user("alice", "alice@example.com", None, None).unwrap();
        let bob = db.insert_user("bob", "bob@example.com", None, None).unwrap();
        let ch = db.create_channel("secret", true).unwrap();

        let inv = db.create_invitation(ch.id, alice, bob).unwrap();
        assert_eq!(inv.status, InvitationStatus::Pending);
        assert_eq!(db.pending_invitations_for(bob).unwrap().len(), 1);

        assert!(db.set_invitation_status(inv.id, InvitationStatus::Accepted).unwrap());
        assert!(db.pending_invitations_for(bob).unwrap().is_empty());

        // re-inviting reopens the same row
        let again = db.create_invitation(ch.id, alice, bob).unwrap();
        assert_eq!(again.id, inv.id);
        assert_eq!(again.status, InvitationStatus::Pending);
    }

    #[test]
    fn channel_delete_cascades_members() {
        let db = Db::open_memory().unwrap();
        let alice = db.insert_user("alice", "alice@example.com", None, None).unwrap();
        let ch = db.create_channel("tmp", false).unwrap();
        db.add_member(ch.id, alice).unwrap();
        db.conn().execute("DELETE FROM channels WHERE id = ?1", params![ch.id]).unwrap();
        assert!(db.memberships().unwrap().is_empty());
    }
}
