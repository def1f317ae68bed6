//! At-least-once delivery for user- and channel-directed forwards.
//!
//! Every tracked forward stays pending until the target node acknowledges
//! it. A periodic sweep resends entries whose last attempt is older than the
//! ack timeout, up to `max_retries` times, and then drops them as permanent
//! failures. Nothing is retried forever and every drop is counted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::metrics::{self, ReplicationMetrics};
use crate::protocol::{AckPayload, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub sweep_interval: Duration,
    pub ack_timeout: Duration,
    pub max_retries: u32,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub message_id: String,
    pub target_server: String,
    pub kind: MessageKind,
    /// Envelope payload, resent verbatim.
    pub payload: Value,
    /// Wall-clock time of the first send, for diagnostics.
    pub sent_at: DateTime<Utc>,
    pub last_attempt: Instant,
    pub retry_count: u32,
}

impl PendingMessage {
    pub fn age(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.sent_at)
    }
}

/// What a sweep decided.
#[derive(Debug, Default)]
pub struct SweepResult {
    /// Entries to send again; their retry count is already incremented.
    pub resend: Vec<PendingMessage>,
    /// Entries dropped for good.
    pub failed: Vec<PendingMessage>,
}

pub struct ReliableDeliveryTracker {
    policy: DeliveryPolicy,
    pending: Mutex<HashMap<String, PendingMessage>>,
    metrics: Arc<ReplicationMetrics>,
}

impl ReliableDeliveryTracker {
    pub fn new(policy: DeliveryPolicy, metrics: Arc<ReplicationMetrics>) -> Self {
        Self { policy, pending: Mutex::new(HashMap::new()), metrics }
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Record a forward that was just sent.
    /// Start tracking a forward. Kinds that are never acknowledged are
    /// refused, since they would only ever expire.
    pub fn track(&self, message_id: &str, target_server: &str, kind: MessageKind, payload: Value) -> bool {
        if !kind.is_tracked() {
            tracing::warn!(msg_id = %message_id, kind = %kind, "Refusing to track a kind that is never acknowledged");
            return false;
        }
        let entry = PendingMessage {
            message_id: message_id.to_string(),
            target_server: target_server.to_string(),
            kind,
            payload,
            sent_at: Utc::now(),
            last_attempt: Instant::now(),
            retry_count: 0,
        };
        self.pending.lock().insert(message_id.to_string(), entry);
        true
    }

    /// Match an acknowledgment to its pending entry and remove it.
    pub fn acknowledge(&self, ack: &AckPayload) -> Option<PendingMessage> {
        let Some(entry) = self.pending.lock().remove(&ack.message_id) else {
            tracing::debug!(msg_id = %ack.message_id, "Ack for unknown or already settled message");
            return None;
        };
        if ack.success {
            self.metrics.increment(metrics::CONFIRMED);
            tracing::debug!(msg_id = %ack.message_id, peer = %ack.origin_server_id, "Delivery confirmed");
        } else {
            self.metrics.increment(metrics::FAILED);
            tracing::warn!(
                msg_id = %ack.message_id,
                peer = %ack.origin_server_id,
                error = ack.error.as_deref().unwrap_or("unknown"),
                "Delivery rejected by target"
            );
        }
        Some(entry)
    }

    /// Expire entries as of `now`.
    pub fn sweep(&self, now: Instant) -> SweepResult {
        let mut result = SweepResult::default();
        let mut pending = self.pending.lock();
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_attempt) >= self.policy.ack_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            let Some(entry) = pending.get_mut(&id) else { continue };
            if entry.retry_count < self.policy.max_retries {
                entry.retry_count += 1;
                entry.last_attempt = now;
                result.resend.push(entry.clone());
            } else if let Some(entry) = pending.remove(&id) {
                result.failed.push(entry);
            }
        }
        drop(pending);

        for entry in &result.resend {
            self.metrics.increment(metrics::RETRIED);
            tracing::info!(
                msg_id = %entry.message_id,
                peer = %entry.target_server,
                retry = entry.retry_count,
                "Retrying unacknowledged message"
            );
        }
        for entry in &result.failed {
            self.metrics.increment(metrics::PERMANENT_FAILURE);
            tracing::error!(
                msg_id = %entry.message_id,
                peer = %entry.target_server,
                kind = %entry.kind,
                attempts = entry.retry_count + 1,
                "Giving up on message after retries"
            );
        }
        result
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Pending entries, oldest first.
    pub fn pending(&self) -> Vec<PendingMessage> {
        let mut all: Vec<_> = self.pending.lock().values().cloned().collect();
        all.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.message_id.cmp(&b.message_id)));
        all
    }
}
