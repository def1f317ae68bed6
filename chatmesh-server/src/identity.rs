//! Server identities and aliases.
//!
//! A node is known by its operator-chosen server id (which may collide with
//! another node's), by the instance id it generates at startup (which never
//! does), and by `server_id@host` forms built from the addresses peers see
//! it on. All comparisons are case-insensitive on trimmed input.

use std::collections::HashSet;
use std::net::IpAddr;

use parking_lot::RwLock;

/// Lookup key for an identity or alias.
pub fn normalize(id: &str) -> String {
    id.trim().to_ascii_lowercase()
}

/// Reduce a declared name to something safe to embed in an alias: ASCII
/// alphanumerics, `_` and `-`, with runs of anything else collapsed to a
/// single `-`. Returns `None` if nothing usable is left.
pub fn sanitize_alias_base(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let out = out.trim_matches('-');
    if out.is_empty() { None } else { Some(out.to_string()) }
}

/// Synthesized identity for a peer whose declared id is missing or clashes
/// with ours: `<base>@<host>`, with the base taken from the sanitized
/// declared name, else from the observed host, else the literal `peer`.
pub fn fallback_identifier(declared: Option<&str>, host: &str) -> String {
    let base = declared
        .and_then(sanitize_alias_base)
        .or_else(|| sanitize_alias_base(host))
        .unwrap_or_else(|| "peer".to_string());
    let host = host.trim();
    if host.is_empty() {
        base
    } else {
        format!("{base}@{host}")
    }
}

/// `base@host` together with `base` and `host` on their own. Plain ids
/// yield just themselves.
pub fn alias_forms(id: &str) -> Vec<String> {
    let id = id.trim();
    if id.is_empty() {
        return Vec::new();
    }
    let mut forms = vec![id.to_string()];
    if let Some((base, host)) = id.split_once('@') {
        for part in [base, host] {
            let part = part.trim();
            if !part.is_empty() && !forms.iter().any(|f| f.eq_ignore_ascii_case(part)) {
                forms.push(part.to_string());
            }
        }
    }
    forms
}

/// Every name under which this node may be addressed.
pub struct LocalAliases {
    server_id: String,
    instance_id: String,
    identifiers: RwLock<HashSet<String>>,
    hosts: RwLock<HashSet<String>>,
}

impl LocalAliases {
    pub fn new(server_id: &str, instance_id: &str) -> Self {
        let mut identifiers = HashSet::new();
        for id in [server_id, instance_id] {
            let id = normalize(id);
            if !id.is_empty() {
                identifiers.insert(id);
            }
        }
        Self {
            server_id: server_id.trim().to_string(),
            instance_id: instance_id.trim().to_string(),
            identifiers: RwLock::new(identifiers),
            hosts: RwLock::new(HashSet::new()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Record an address this node was reached on. Loopback and unspecified
    /// addresses are shared by every process on a host and are ignored.
    pub fn register_address(&self, addr: IpAddr) {
        if addr.is_loopback() || addr.is_unspecified() {
            return;
        }
        self.register_host(&addr.to_string());
    }

    pub fn register_host(&self, host: &str) {
        let host = normalize(host);
        if host.is_empty() || self.server_id.is_empty() {
            return;
        }
        if self.hosts.write().insert(host.clone()) {
            let alias = format!("{}@{host}", normalize(&self.server_id));
            tracing::debug!(alias = %alias, "Registered local alias");
            self.identifiers.write().insert(alias);
        }
    }

    /// True if `candidate` names this node.
    pub fn is_local(&self, candidate: &str) -> bool {
        let candidate = normalize(candidate);
        if candidate.is_empty() {
            return false;
        }
        if self.identifiers.read().contains(&candidate) {
            return true;
        }
        let Some((base, host)) = candidate.split_once('@') else {
            return false;
        };
        if base != normalize(&self.server_id) || host.is_empty() {
            return false;
        }
        if self.hosts.read().contains(host) {
            self.identifiers.write().insert(candidate);
            return true;
        }
        false
    }

    pub fn aliases(&self) -> Vec<String> {
        let mut all: Vec<String> = self.identifiers.read().iter().cloned().collect();
        all.sort();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_and_trims() {
        assert_eq!(sanitize_alias_base("  Chat Node #1 ").as_deref(), Some("Chat-Node-1"));
        assert_eq!(sanitize_alias_base("10.0.0.2").as_deref(), Some("10-0-0-2"));
        assert_eq!(sanitize_alias_base("!!!"), None);
        assert_eq!(sanitize_alias_base(""), None);
    }

    #[test]
    fn fallback_preference_order() {
        assert_eq!(fallback_identifier(Some("alpha"), "10.0.0.2"), "alpha@10.0.0.2");
        assert_eq!(fallback_identifier(Some("  "), "10.0.0.2"), "10-0-0-2@10.0.0.2");
        assert_eq!(fallback_identifier(None, ""), "peer");
        assert_eq!(fallback_identifier(None, "::"), "peer@::");
    }

    #[test]
    fn alias_decomposition() {
        assert_eq!(alias_forms("alpha@10.0.0.2"), vec!["alpha@10.0.0.2", "alpha", "10.0.0.2"]);
        assert_eq!(alias_forms("beta"), vec!["beta"]);
        assert!(alias_forms(" ").is_empty());
    }

    #[test]
    fn local_matching() {
        let local = LocalAliases::new("Alpha", "inst-1");
        assert!(local.is_local("alpha"));
        assert!(local.is_local(" INST-1 "));
        assert!(!local.is_local("alpha@10.0.0.2"));

        local.register_address("10.0.0.2".parse().unwrap());
        local.register_address("127.0.0.1".parse().unwrap());
        assert!(local.is_local("alpha@10.0.0.2"));
        assert!(!local.is_local("alpha@127.0.0.1"));
        // another node on the same host is not us
        assert!(!local.is_local("beta@10.0.0.2"));
        assert!(!local.is_local(""));
        assert!(local.aliases().contains(&"alpha@10.0.0.2".to_string()));
    }
}
