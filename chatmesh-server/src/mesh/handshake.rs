//! HELLO exchange.
//!
//! Both ends send HELLO as soon as the socket is up. A link is usable once
//! it has sent one and received one, in either order; completion fires
//! exactly once per link no matter how the two races interleave.

use std::sync::Arc;

use super::PeerManager;
use super::directory::Admission;
use super::link::PeerLink;
use crate::protocol::{HelloPayload, PeerEnvelope, PeerMessage};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Handshake {
    hello_sent: bool,
    hello_received: bool,
    completed: bool,
    /// Server id as the peer announced it.
    pub declared_id: Option<String>,
    pub instance_id: Option<String>,
    /// Canonical id assigned by the directory.
    pub resolved_id: Option<String>,
}

impl Handshake {
    /// Returns true if this call completed the handshake.
    pub fn mark_sent(&mut self) -> bool {
        self.hello_sent = true;
        self.try_complete()
    }

    /// Record the peer's HELLO. Repeated HELLOs keep the first identity.
    /// Returns true if this call completed the handshake.
    pub fn mark_received(&mut self, declared_id: Option<String>, instance_id: Option<String>) -> bool {
        if self.hello_received {
            return false;
        }
        self.hello_received = true;
        self.declared_id = declared_id;
        self.instance_id = instance_id;
        self.try_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    fn try_complete(&mut self) -> bool {
        if self.hello_sent && self.hello_received && !self.completed {
            self.completed = true;
            return true;
        }
        false
    }
}

fn non_blank(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() { None } else { Some(s.to_string()) }
}

impl PeerManager {
    pub(super) fn send_hello(&self, link: &Arc<PeerLink>) {
        let hello = PeerMessage::Hello(HelloPayload {
            server_id: self.aliases.server_id().to_string(),
            instance_id: self.aliases.instance_id().to_string(),
        });
        let envelope = match PeerEnvelope::new(self.aliases.server_id(), &hello) {
            Ok(e) => e,
            Err(e) => {
                tracing::error!("Failed to encode HELLO: {e}");
                return;
            }
        };
        if !self.transmit(link, envelope) {
            return;
        }
        let completed = link.handshake().mark_sent();
        if completed {
            self.complete_handshake(link);
        }
    }

    pub(super) fn on_hello(&self, link: &Arc<PeerLink>, hello: HelloPayload, origin: &str) {
        let declared = non_blank(&hello.server_id).or_else(|| non_blank(origin));
        let instance = non_blank(&hello.instance_id);

        let completed = link.handshake().mark_received(declared, instance);
        if completed {
            self.complete_handshake(link);
        }
    }

    fn complete_handshake(&self, link: &Arc<PeerLink>) {
        let peer_id = match self.directory.admit(link) {
            Ok(Admission::Added(id)) => id,
            Ok(Admission::Replaced { id, previous }) => {
                tracing::info!(peer = %id, gen = link.generation(), old_gen = previous.generation(),
                    "Duplicate link to same instance, replacing older one");
                self.close_link(&previous);
                id
            }
            Ok(Admission::Duplicate { id, kept }) => {
                tracing::info!(peer = %id, gen = link.generation(), kept_gen = kept.generation(),
                    "Duplicate link to same instance, keeping existing one");
                self.close_link(link);
                return;
            }
            Err(e) => {
                tracing::warn!(addr = %link.remote_addr(), "Rejecting peer: {e}");
                self.close_link(link);
                return;
            }
        };

        self.presence.remember_server(&peer_id);
        let declared = link.declared_id().unwrap_or_default();
        tracing::info!(
            peer = %peer_id,
            declared = %declared,
            incoming = link.is_incoming(),
            addr = %link.remote_addr(),
            "Peer link established"
        );
        self.send_sync_state(link);
        self.notify_peer_connected(&peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_once_sent_first() {
        let mut h = Handshake::default();
        assert!(!h.mark_sent());
        assert!(h.mark_received(Some("beta".into()), Some("i-2".into())));
        assert!(h.is_complete());
        assert!(!h.mark_sent());
        assert!(!h.mark_received(Some("other".into()), None));
        assert_eq!(h.declared_id.as_deref(), Some("beta"));
    }

    #[test]
    fn completes_once_received_first() {
        let mut h = Handshake::default();
        assert!(!h.mark_received(None, None));
        assert!(!h.is_complete());
        assert!(h.mark_sent());
        assert!(!h.mark_sent());
    }
}
