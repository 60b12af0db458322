//! Activity tracking for the media hot path.
//!
//! [`ActivityTracker::record_activity`] is called for every successful
//! transfer, so it must never wait: if the record's shard is busy the update
//! is skipped and the next transfer will refresh the timestamp.

use pipeline_graph::EndpointRole;
use tokio::time::Instant;

use super::record::{WatchdogKey, WatchdogStore};

/// Cloneable handle for reporting and reading endpoint activity.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    store: WatchdogStore,
}

impl ActivityTracker {
    pub fn new(store: WatchdogStore) -> Self {
        Self { store }
    }

    /// Report a successful transfer. Silently ignored for unsupervised
    /// endpoints or when the record is momentarily locked.
    pub fn record_activity(&self, instance_id: &str, role: EndpointRole) {
        let key = WatchdogKey::new(instance_id, role);
        let now = Instant::now();
        self.store.try_update(&key, |record| record.touch(now));
    }

    pub fn last_activity(&self, instance_id: &str, role: EndpointRole) -> Option<Instant> {
        self.store
            .snapshot(&WatchdogKey::new(instance_id, role))
            .and_then(|snapshot| snapshot.last_activity)
    }

    /// Whether the endpoint has ever seen activity. False for unknown keys.
    pub fn is_connected(&self, instance_id: &str, role: EndpointRole) -> bool {
        self.store
            .snapshot(&WatchdogKey::new(instance_id, role))
            .is_some_and(|snapshot| snapshot.has_connected)
    }

    /// Refresh activity after a successful recovery.
    ///
    /// Unlike [`record_activity`](Self::record_activity) this waits for the
    /// record, so the watchdog never sees the pre-recovery silence again.
    pub fn mark_reconnected(&self, instance_id: &str, role: EndpointRole) {
        let key = WatchdogKey::new(instance_id, role);
        let now = Instant::now();
        self.store.update(&key, |record| record.touch(now));
    }
}
