//! Established links by canonical peer id, plus every alias they answer to.
//!
//! Each remote node gets exactly one canonical id. A missing or self-clashing
//! declared id is replaced by a `base@host` fallback, and a candidate already
//! held by a different node gets a `-2`, `-3`, ... suffix (random once the
//! small numbers run out). Two links to the same instance are not a
//! collision: they are the same node dialled twice, and only one survives.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::link::PeerLink;
use crate::error::LinkError;
use crate::identity::{self, LocalAliases, normalize};

const MAX_NUMERIC_SUFFIX: u32 = 16;

/// Result of admitting a link whose handshake just completed.
pub enum Admission {
    Added(String),
    /// The link replaced an older one to the same instance.
    Replaced { id: String, previous: Arc<PeerLink> },
    /// An existing link to the same instance was kept instead.
    Duplicate { id: String, kept: Arc<PeerLink> },
}

pub struct PeerDirectory {
    local: Arc<LocalAliases>,
    /// normalized canonical id → link
    links: RwLock<HashMap<String, Arc<PeerLink>>>,
    /// normalized alias → normalized canonical id
    aliases: RwLock<HashMap<String, String>>,
}

impl PeerDirectory {
    pub fn new(local: Arc<LocalAliases>) -> Self {
        Self {
            local,
            links: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
        }
    }

    /// Assign the link its canonical id and make it routable.
    pub fn admit(&self, link: &Arc<PeerLink>) -> Result<Admission, LinkError> {
        let (declared, instance) = {
            let h = link.handshake();
            (h.declared_id.clone(), h.instance_id.clone())
        };
        let host = link.remote_host();
        if let Some(instance) = instance.as_deref().filter(|i| i.eq_ignore_ascii_case(self.local.instance_id())) {
            return Err(LinkError::SelfConnection(instance.to_string()));
        }

        let mut links = self.links.write();

        let same_instance = instance.as_deref().and_then(|instance| {
            links
                .values()
                .find(|l| {
                    l.generation() != link.generation()
                        && l.instance_id().is_some_and(|i| i.eq_ignore_ascii_case(instance))
                })
                .cloned()
                .map(|l| (instance, l))
        });
        if let Some((instance, existing)) = same_instance {
            let id = existing.remote_id().unwrap_or_default();
            if !self.prefers(link, &existing, instance) {
                return Ok(Admission::Duplicate { id, kept: existing });
            }
            link.handshake().resolved_id = Some(id.clone());
            links.insert(normalize(&id), Arc::clone(link));
            drop(links);
            self.register_aliases(&id, declared.as_deref(), Some(instance));
            return Ok(Admission::Replaced { id, previous: existing });
        }

        let id = self.resolve(&links, declared.as_deref(), &host);
        link.handshake().resolved_id = Some(id.clone());
        links.insert(normalize(&id), Arc::clone(link));
        drop(links);
        self.register_aliases(&id, declared.as_deref(), instance.as_deref());
        Ok(Admission::Added(id))
    }

    /// Of two links to the same instance, the node with the lower instance
    /// id keeps the link it dialled and the other node keeps the one it
    /// accepted, so both ends converge on the same socket.
    fn prefers(&self, candidate: &PeerLink, existing: &PeerLink, remote_instance: &str) -> bool {
        let we_are_lower = normalize(self.local.instance_id()) < normalize(remote_instance);
        let wanted_incoming = !we_are_lower;
        if candidate.is_incoming() == existing.is_incoming() {
            return candidate.generation() > existing.generation();
        }
        candidate.is_incoming() == wanted_incoming
    }

    fn resolve(
        &self,
        links: &HashMap<String, Arc<PeerLink>>,
        declared: Option<&str>,
        host: &str,
    ) -> String {
        let declared = declared.map(str::trim).filter(|d| !d.is_empty());
        let mut candidate = match declared {
            Some(d) if !self.local.is_local(d) => d.to_string(),
            Some(d) => {
                let fallback = identity::fallback_identifier(Some(d), host);
                tracing::warn!(declared = %d, fallback = %fallback, "Peer announced our own id, using fallback");
                fallback
            }
            None => {
                let fallback = identity::fallback_identifier(None, host);
                tracing::warn!(fallback = %fallback, "Peer announced no id, using fallback");
                fallback
            }
        };

        let taken = |c: &str| links.contains_key(&normalize(c)) || self.local.is_local(c);
        if taken(&candidate) {
            let base = candidate.clone();
            candidate = (2..=MAX_NUMERIC_SUFFIX)
                .map(|n| format!("{base}-{n}"))
                .find(|c| !taken(c))
                .unwrap_or_else(|| loop {
                    let c = format!("{base}-{:06x}", rand::random::<u32>() & 0x00ff_ffff);
                    if !taken(&c) {
                        break c;
                    }
                });
            tracing::warn!(base = %base, resolved = %candidate, "Peer id collision, disambiguated");
        }
        candidate
    }

    fn register_aliases(&self, id: &str, declared: Option<&str>, instance: Option<&str>) {
        let key = normalize(id);
        let mut forms = identity::alias_forms(id);
        if let Some(declared) = declared {
            forms.extend(identity::alias_forms(declared));
        }
        let mut aliases = self.aliases.write();
        for form in forms {
            let alias = normalize(&form);
            if alias.is_empty() || self.local.is_local(&alias) {
                continue;
            }
            aliases.entry(alias).or_insert_with(|| key.clone());
        }
        if let Some(instance) = instance {
            aliases.insert(normalize(instance), key);
        }
    }

    /// Remove `link` if it is still the one registered under its id.
    /// Returns false when a newer link already took its place.
    pub fn remove(&self, link: &PeerLink) -> bool {
        let Some(id) = link.remote_id() else {
            return false;
        };
        let key = normalize(&id);
        let mut links = self.links.write();
        match links.get(&key) {
            Some(current) if current.generation() == link.generation() => {
                links.remove(&key);
            }
            _ => return false,
        }
        drop(links);
        self.aliases.write().retain(|_, canonical| *canonical != key);
        true
    }

    /// Link reachable under `target`, by canonical id or any alias.
    pub fn lookup(&self, target: &str) -> Option<Arc<PeerLink>> {
        let key = normalize(target);
        if key.is_empty() {
            return None;
        }
        if let Some(link) = self.links.read().get(&key) {
            return Some(Arc::clone(link));
        }
        let canonical = self.aliases.read().get(&key).cloned()?;
        self.links.read().get(&canonical).cloned()
    }

    pub fn is_connected(&self, target: &str) -> bool {
        self.lookup(target).is_some()
    }

    pub fn links(&self) -> Vec<Arc<PeerLink>> {
        self.links.read().values().cloned().collect()
    }

    /// Canonical ids of every established peer, sorted.
    pub fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.links.read().values().filter_map(|l| l.remote_id()).collect();
        ids.sort();
        ids
    }

    pub fn aliases_of(&self, id: &str) -> Vec<String> {
        let key = normalize(id);
        let mut out: Vec<String> = self
            .aliases
            .read()
            .iter()
            .filter(|(_, canonical)| **canonical == key)
            .map(|(alias, _)| alias.clone())
            .collect();
        out.sort();
        out
    }

    pub fn clear(&self) -> Vec<Arc<PeerLink>> {
        self.aliases.write().clear();
        self.links.write().drain().map(|(_, l)| l).collect()
    }
}
