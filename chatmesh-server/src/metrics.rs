//! Replication counters.
//!
//! Counters are monotonically increasing and live for the lifetime of the
//! process. Every increment is also emitted through tracing under the
//! `metrics` target so a log pipeline can aggregate them.

use std::collections::BTreeMap;

use parking_lot::Mutex;

pub const SENT: &str = "sent";
pub const RECEIVED: &str = "received";
pub const CONFIRMED: &str = "confirmed";
pub const FAILED: &str = "failed";
pub const RETRIED: &str = "retried";
pub const PERMANENT_FAILURE: &str = "permanent_failure";

#[derive(Default)]
pub struct ReplicationMetrics {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl ReplicationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, delta: u64) {
        let value = {
            let mut counters = self.counters.lock();
            let slot = counters.entry(name.to_string()).or_insert(0);
            *slot = slot.saturating_add(delta);
            *slot
        };
        tracing::debug!(target: "metrics", metric = name, value, "counter");
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// Point-in-time copy of every counter, sorted by name.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = ReplicationMetrics::new();
        m.increment(SENT);
        m.increment(SENT);
        m.add(RECEIVED, 5);
        assert_eq!(m.get(SENT), 2);
        assert_eq!(m.get(RECEIVED), 5);
        assert_eq!(m.get(FAILED), 0);

        let snap = m.snapshot();
        assert_eq!(snap.keys().collect::<Vec<_>>(), vec![RECEIVED, SENT]);
    }
}
