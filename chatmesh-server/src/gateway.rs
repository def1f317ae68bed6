//! Delivery to clients connected to this node.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Pushes payloads to local client sessions.
pub trait LocalDeliveryGateway: Send + Sync {
    /// Queue `payload` for one session. False if the session is gone.
    fn deliver_to_session(&self, session_id: &str, payload: &Value) -> bool;

    /// Queue `payload` for every local session; returns how many got it.
    fn broadcast_local(&self, payload: &Value) -> usize;

    fn deliver_to_sessions(&self, session_ids: &[String], payload: &Value) -> usize {
        session_ids
            .iter()
            .filter(|id| self.deliver_to_session(id, payload))
            .count()
    }
}

/// Gateway backed by one outbound line queue per client connection, the
/// same shape a client writer task drains.
#[derive(Default)]
pub struct SessionOutbox {
    sessions: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl SessionOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a session and return the receiving end of its queue.
    pub fn attach(&self, session_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.write().insert(session_id.to_string(), tx);
        rx
    }

    pub fn detach(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }

    fn frame(payload: &Value) -> String {
        json!({ "command": "EVENT", "payload": payload }).to_string()
    }
}

impl LocalDeliveryGateway for SessionOutbox {
    fn deliver_to_session(&self, session_id: &str, payload: &Value) -> bool {
        let Some(tx) = self.sessions.read().get(session_id).cloned() else {
            return false;
        };
        if tx.send(Self::frame(payload)).is_err() {
            tracing::debug!(session = %session_id, "Client queue closed, detaching");
            self.detach(session_id);
            return false;
        }
        true
    }

    fn broadcast_local(&self, payload: &Value) -> usize {
        let line = Self::frame(payload);
        let sessions: Vec<(String, mpsc::UnboundedSender<String>)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();
        let mut delivered = 0;
        for (id, tx) in sessions {
            if tx.send(line.clone()).is_ok() {
                delivered += 1;
            } else {
                self.detach(&id);
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_framed_lines() {
        let outbox = SessionOutbox::new();
        let mut rx = outbox.attach("session-1");
        let _rx2 = outbox.attach("session-2");

        assert!(outbox.deliver_to_session("session-1", &json!({"text": "hi"})));
        assert!(!outbox.deliver_to_session("session-9", &json!({})));
        let line = rx.recv().await.unwrap();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["command"], "EVENT");
        assert_eq!(v["payload"]["text"], "hi");

        assert_eq!(outbox.broadcast_local(&json!({"n": 1})), 2);
        let ids = vec!["session-1".to_string(), "session-2".to_string(), "gone".to_string()];
        assert_eq!(outbox.deliver_to_sessions(&ids, &json!({})), 2);
    }

    #[test]
    fn closed_queue_detaches() {
        let outbox = SessionOutbox::new();
        drop(outbox.attach("session-1"));
        assert!(!outbox.deliver_to_session("session-1", &json!({})));
        assert_eq!(outbox.broadcast_local(&json!({})), 0);
    }
}
