//! Who is connected where.
//!
//! Local sessions are owned by this node and mutated only through the
//! session lifecycle calls. Remote sessions are a read-only cache per server,
//! replaced by SYNC_STATE, patched by CLIENT_* and CHANNEL_MEMBERSHIP
//! envelopes, and drained when the link to that server drops.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::identity::normalize;
use crate::protocol::{MembershipAction, RemoteSessionSnapshot};

/// A session connected to this node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub ip: Option<String>,
    /// Joined channel ids with their UUIDs where known.
    pub channels: BTreeMap<i64, Option<String>>,
}

impl SessionDescriptor {
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn to_remote(&self, server_id: &str) -> RemoteSessionSnapshot {
        RemoteSessionSnapshot {
            session_id: self.session_id.clone(),
            user_id: self.user_id,
            username: self.username.clone(),
            email: self.email.clone(),
            ip: self.ip.clone(),
            server_id: server_id.to_string(),
            channels: self.channels.keys().copied().collect(),
            channel_uuids: self.channels.values().flatten().cloned().collect(),
        }
    }
}

/// How a user is identified in a send. Remote nodes number users
/// differently, so the natural keys take precedence over the id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserKey {
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub email: Option<String>,
}

fn same_key(a: Option<&str>, b: Option<&str>) -> Option<bool> {
    match (a.map(normalize).filter(|s| !s.is_empty()), b.map(normalize).filter(|s| !s.is_empty())) {
        (Some(a), Some(b)) => Some(a == b),
        _ => None,
    }
}

impl UserKey {
    fn matches_remote(&self, snap: &RemoteSessionSnapshot) -> bool {
        same_key(self.email.as_deref(), snap.email.as_deref())
            .or_else(|| same_key(self.username.as_deref(), snap.username.as_deref()))
            .unwrap_or_else(|| self.user_id.is_some() && self.user_id == snap.user_id)
    }

    fn matches_local(&self, s: &SessionDescriptor) -> bool {
        (self.user_id.is_some() && self.user_id == s.user_id)
            || same_key(self.email.as_deref(), s.email.as_deref()) == Some(true)
            || same_key(self.username.as_deref(), s.username.as_deref()) == Some(true)
    }
}

/// Where a send should go.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendPlan {
    pub local_sessions: Vec<String>,
    pub remote_servers: Vec<String>,
}

impl SendPlan {
    pub fn is_empty(&self) -> bool {
        self.local_sessions.is_empty() && self.remote_servers.is_empty()
    }
}

pub struct PresenceDirectory {
    server_id: String,
    local: RwLock<HashMap<String, SessionDescriptor>>,
    /// server id → session id → snapshot
    remote: RwLock<HashMap<String, HashMap<String, RemoteSessionSnapshot>>>,
    known_servers: RwLock<BTreeSet<String>>,
    next_session: AtomicU64,
}

impl PresenceDirectory {
    pub fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            local: RwLock::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
            known_servers: RwLock::new(BTreeSet::new()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    // ── Local sessions ─────────────────────────────────────────────────

    /// Register a new anonymous session and return its id.
    pub fn open_session(&self, ip: Option<&str>) -> String {
        let n = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session_id = format!("session-{n}");
        self.local.write().insert(
            session_id.clone(),
            SessionDescriptor {
                session_id: session_id.clone(),
                ip: ip.map(str::to_string),
                ..Default::default()
            },
        );
        session_id
    }

    pub fn authenticate(
        &self,
        session_id: &str,
        user_id: i64,
        username: &str,
        email: &str,
    ) -> Option<SessionDescriptor> {
        let mut local = self.local.write();
        let session = local.get_mut(session_id)?;
        session.user_id = Some(user_id);
        session.username = Some(username.to_string());
        session.email = Some(email.to_string());
        Some(session.clone())
    }

    pub fn close_session(&self, session_id: &str) -> Option<SessionDescriptor> {
        self.local.write().remove(session_id)
    }

    /// Returns the updated descriptor if the session was not already a member.
    pub fn join_channel(
        &self,
        session_id: &str,
        channel_id: i64,
        channel_uuid: Option<&str>,
    ) -> Option<SessionDescriptor> {
        let mut local = self.local.write();
        let session = local.get_mut(session_id)?;
        let uuid = channel_uuid.map(str::to_string);
        match session.channels.insert(channel_id, uuid.clone()) {
            Some(previous) if previous == uuid => None,
            _ => Some(session.clone()),
        }
    }

    pub fn leave_channel(&self, session_id: &str, channel_id: i64) -> Option<SessionDescriptor> {
        let mut local = self.local.write();
        let session = local.get_mut(session_id)?;
        session.channels.remove(&channel_id)?;
        Some(session.clone())
    }

    pub fn local_session(&self, session_id: &str) -> Option<SessionDescriptor> {
        self.local.read().get(session_id).cloned()
    }

    pub fn local_sessions(&self) -> Vec<SessionDescriptor> {
        let mut all: Vec<_> = self.local.read().values().cloned().collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        all
    }

    /// Number of local sessions authenticated as `user_id`.
    pub fn local_session_count(&self, user_id: i64) -> usize {
        self.local.read().values().filter(|s| s.user_id == Some(user_id)).count()
    }

    // ── Remote sessions ────────────────────────────────────────────────

    pub fn remember_server(&self, server_id: &str) {
        let server_id = server_id.trim();
        if !server_id.is_empty() && server_id != self.server_id {
            self.known_servers.write().insert(server_id.to_string());
        }
    }

    pub fn known_servers(&self) -> BTreeSet<String> {
        self.known_servers.read().clone()
    }

    /// Replace everything known about `server_id`'s sessions.
    /// Returns true if the cached set changed.
    pub fn register_remote_sessions(&self, server_id: &str, sessions: Vec<RemoteSessionSnapshot>) -> bool {
        self.remember_server(server_id);
        let incoming: HashMap<String, RemoteSessionSnapshot> = sessions
            .into_iter()
            .map(|mut s| {
                s.server_id = server_id.to_string();
                (s.session_id.clone(), s)
            })
            .collect();
        let mut remote = self.remote.write();
        if remote.get(server_id).map_or(incoming.is_empty(), |current| *current == incoming) {
            return false;
        }
        remote.insert(server_id.to_string(), incoming);
        true
    }

    pub fn register_remote_session(&self, server_id: &str, mut session: RemoteSessionSnapshot) -> bool {
        self.remember_server(server_id);
        session.server_id = server_id.to_string();
        let mut remote = self.remote.write();
        let sessions = remote.entry(server_id.to_string()).or_default();
        if sessions.get(&session.session_id) == Some(&session) {
            return false;
        }
        sessions.insert(session.session_id.clone(), session);
        true
    }

    pub fn remove_remote_session(&self, server_id: &str, session_id: &str) -> Option<RemoteSessionSnapshot> {
        self.remote.write().get_mut(server_id)?.remove(session_id)
    }

    /// Apply a membership change to a cached remote session.
    pub fn update_remote_channel(
        &self,
        server_id: &str,
        session_id: &str,
        channel_id: i64,
        channel_uuid: Option<&str>,
        action: MembershipAction,
    ) -> bool {
        let mut remote = self.remote.write();
        let Some(session) = remote.get_mut(server_id).and_then(|s| s.get_mut(session_id)) else {
            return false;
        };
        match action {
            MembershipAction::Join => {
                let added = session.channels.insert(channel_id);
                let uuid_added = channel_uuid.is_some_and(|u| session.channel_uuids.insert(u.to_string()));
                added || uuid_added
            }
            MembershipAction::Leave => {
                let removed = session.channels.remove(&channel_id);
                let uuid_removed = channel_uuid.is_some_and(|u| session.channel_uuids.remove(u));
                removed || uuid_removed
            }
        }
    }

    /// Remove and return every cached session of `server_id`. The server
    /// stays known so diagnostics can report it as unreachable.
    pub fn drain_remote_sessions(&self, server_id: &str) -> Vec<RemoteSessionSnapshot> {
        let drained = self.remote.write().remove(server_id).unwrap_or_default();
        let mut sessions: Vec<_> = drained.into_values().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn remote_sessions(&self, server_id: &str) -> Vec<RemoteSessionSnapshot> {
        let mut sessions: Vec<_> = self
            .remote
            .read()
            .get(server_id)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Sessions per server, this node's included, with every known server
    /// listed even when it has none.
    pub fn sessions_by_server(&self) -> BTreeMap<String, Vec<RemoteSessionSnapshot>> {
        let mut out: BTreeMap<String, Vec<RemoteSessionSnapshot>> = BTreeMap::new();
        for server in self.known_servers() {
            out.insert(server.clone(), self.remote_sessions(&server));
        }
        out.insert(
            self.server_id.clone(),
            self.local_sessions().iter().map(|s| s.to_remote(&self.server_id)).collect(),
        );
        out
    }

    // ── Send planning ──────────────────────────────────────────────────

    pub fn plan_user_send(&self, key: &UserKey) -> SendPlan {
        let local_sessions: Vec<String> = self
            .local_sessions()
            .into_iter()
            .filter(|s| key.matches_local(s))
            .map(|s| s.session_id)
            .collect();
        let remote_servers = if local_sessions.is_empty() {
            self.remote_servers_where(|s| key.matches_remote(s))
        } else {
            Vec::new()
        };
        SendPlan { local_sessions, remote_servers }
    }

    /// Members of a channel, skipping sessions of `exclude_user` (the author).
    pub fn plan_channel_send(
        &self,
        channel_id: Option<i64>,
        channel_uuid: Option<&str>,
        exclude_user: Option<i64>,
    ) -> SendPlan {
        let local_sessions = self
            .local_sessions()
            .into_iter()
            .filter(|s| exclude_user.is_none() || s.user_id != exclude_user)
            .filter(|s| {
                channel_id.is_some_and(|id| s.channels.contains_key(&id))
                    || channel_uuid.is_some_and(|u| s.channels.values().flatten().any(|v| v == u))
            })
            .map(|s| s.session_id)
            .collect();
        let remote_servers = self.remote_servers_where(|s| match channel_uuid {
            Some(uuid) => s.channel_uuids.contains(uuid),
            None => channel_id.is_some_and(|id| s.channels.contains(&id)),
        });
        SendPlan { local_sessions, remote_servers }
    }

    /// Route for a session id, bare or `server:session`.
    pub fn plan_session_send(&self, session_id: &str) -> SendPlan {
        let mut plan = SendPlan::default();
        if self.local.read().contains_key(session_id) {
            plan.local_sessions.push(session_id.to_string());
            return plan;
        }
        if let Some((server, bare)) = session_id.split_once(':') {
            if server == self.server_id && self.local.read().contains_key(bare) {
                plan.local_sessions.push(bare.to_string());
                return plan;
            }
            if self.remote.read().get(server).is_some_and(|s| s.contains_key(bare)) {
                plan.remote_servers.push(server.to_string());
                return plan;
            }
        }
        plan.remote_servers = self.remote_servers_where(|s| s.session_id == session_id);
        plan
    }

    /// Resolve a session id as the remote side sees it: the bare id when it
    /// lives on `server_id`.
    pub fn bare_session_id<'a>(&self, session_id: &'a str) -> &'a str {
        match session_id.split_once(':') {
            Some((server, bare)) if self.remote.read().contains_key(server) || server == self.server_id => bare,
            _ => session_id,
        }
    }

    fn remote_servers_where(&self, pred: impl Fn(&RemoteSessionSnapshot) -> bool) -> Vec<String> {
        let remote = self.remote.read();
        let mut servers: Vec<String> = remote
            .iter()
            .filter(|(_, sessions)| sessions.values().any(&pred))
            .map(|(server, _)| server.clone())
            .collect();
        servers.sort();
        servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(session: &str, user: i64, email: &str, channels: &[i64], uuids: &[&str]) -> RemoteSessionSnapshot {
        RemoteSessionSnapshot {
            session_id: session.into(),
            user_id: Some(user),
            username: email.split('@').next().map(str::to_string),
            email: Some(email.into()),
            channels: channels.iter().copied().collect(),
            channel_uuids: uuids.iter().map(|u| u.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn local_lifecycle() {
        let p = PresenceDirectory::new("alpha");
        let s = p.open_session(Some("10.0.0.9"));
        assert!(!p.local_session(&s).unwrap().is_authenticated());

        let d = p.authenticate(&s, 42, "bob", "bob@example.com").unwrap();
        assert_eq!(d.user_id, Some(42));
        assert!(p.join_channel(&s, 10, Some("u1")).is_some());
        assert!(p.join_channel(&s, 10, Some("u1")).is_none(), "re-join is a no-op");
        assert_eq!(p.local_session_count(42), 1);

        let snap = p.local_session(&s).unwrap().to_remote("alpha");
        assert!(snap.channels.contains(&10));
        assert!(snap.channel_uuids.contains("u1"));

        assert!(p.leave_channel(&s, 10).is_some());
        assert!(p.leave_channel(&s, 10).is_none());
        assert!(p.close_session(&s).is_some());
        assert_eq!(p.local_session_count(42), 0);
    }

    #[test]
    fn remote_registration_reports_changes() {
        let p = PresenceDirectory::new("alpha");
        let sessions = vec![remote("session-1", 7, "bob@example.com", &[], &[])];
        assert!(p.register_remote_sessions("beta", sessions.clone()));
        assert!(!p.register_remote_sessions("beta", sessions));
        // empty list for an unknown server is not a change, but the server is remembered
        assert!(!p.register_remote_sessions("gamma", vec![]));
        assert!(p.known_servers().contains("gamma"));

        let by_server = p.sessions_by_server();
        assert_eq!(by_server["beta"].len(), 1);
        assert_eq!(by_server["beta"][0].server_id, "beta");
        assert!(by_server["gamma"].is_empty());
        assert!(by_server.contains_key("alpha"));
    }

    #[test]
    fn user_send_prefers_local() {
        let p = PresenceDirectory::new("alpha");
        p.register_remote_sessions("beta", vec![remote("session-1", 7, "bob@example.com", &[], &[])]);

        // alpha numbers bob 42; beta numbers him 7, email decides
        let key = UserKey { user_id: Some(42), email: Some("bob@example.com".into()), username: None };
        assert_eq!(p.plan_user_send(&key).remote_servers, vec!["beta"]);

        // a bare id that happens to match a different remote user does not route
        let wrong = UserKey { user_id: Some(7), email: Some("someone@example.com".into()), username: None };
        assert!(p.plan_user_send(&wrong).is_empty());

        let s = p.open_session(None);
        p.authenticate(&s, 42, "bob", "bob@example.com");
        let plan = p.plan_user_send(&key);
        assert_eq!(plan.local_sessions, vec![s]);
        assert!(plan.remote_servers.is_empty());
    }

    #[test]
    fn channel_send_skips_author_and_matches_uuid() {
        let p = PresenceDirectory::new("alpha");
        let a = p.open_session(None);
        p.authenticate(&a, 1, "alice", "alice@example.com");
        p.join_channel(&a, 10, Some("u1"));
        let b = p.open_session(None);
        p.authenticate(&b, 2, "bob", "bob@example.com");
        p.join_channel(&b, 10, Some("u1"));
        p.register_remote_sessions("beta", vec![remote("session-9", 3, "carol@example.com", &[4], &["u1"])]);
        p.register_remote_sessions("gamma", vec![remote("session-9", 5, "dave@example.com", &[10], &["u2"])]);

        let plan = p.plan_channel_send(Some(10), Some("u1"), Some(1));
        assert_eq!(plan.local_sessions, vec![b]);
        // beta numbers the channel 4 but shares the UUID; gamma's 10 is another channel
        assert_eq!(plan.remote_servers, vec!["beta"]);
    }

    #[test]
    fn session_send_composite_ids() {
        let p = PresenceDirectory::new("alpha");
        p.register_remote_sessions("beta", vec![remote("session-3", 7, "bob@example.com", &[], &[])]);
        assert_eq!(p.plan_session_send("beta:session-3").remote_servers, vec!["beta"]);
        assert_eq!(p.plan_session_send("session-3").remote_servers, vec!["beta"]);
        assert!(p.plan_session_send("beta:session-4").is_empty());
        assert_eq!(p.bare_session_id("beta:session-3"), "session-3");

        let local = p.open_session(None);
        assert_eq!(p.plan_session_send(&format!("alpha:{local}")).local_sessions, vec![local]);
    }

    #[test]
    fn membership_updates_and_drain() {
        let p = PresenceDirectory::new("alpha");
        p.register_remote_session("beta", remote("session-1", 7, "bob@example.com", &[], &[]));
        assert!(p.update_remote_channel("beta", "session-1", 4, Some("u1"), MembershipAction::Join));
        assert!(!p.update_remote_channel("beta", "session-1", 4, Some("u1"), MembershipAction::Join));
        assert!(!p.update_remote_channel("beta", "missing", 4, None, MembershipAction::Join));

        let drained = p.drain_remote_sessions("beta");
        assert_eq!(drained.len(), 1);
        assert!(drained[0].channel_uuids.contains("u1"));
        assert!(p.remote_sessions("beta").is_empty());
        assert!(p.known_servers().contains("beta"));
        assert!(p.remove_remote_session("beta", "session-1").is_none());
    }
}
