//! Watchdog metrics for observability.
//!
//! Lock-free counters for lifecycle and reconnect events, plus a broadcast
//! channel of [`WatchdogEvent`]s for callers that want to react to them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;

use super::record::WatchdogKey;

/// Lifecycle and recovery events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogEvent {
    Started { key: WatchdogKey },
    Stopped { key: WatchdogKey, forced: bool },
    Connected { key: WatchdogKey },
    Reconnected { key: WatchdogKey },
    ReconnectFailed { key: WatchdogKey, attempts: u32 },
    Exhausted { key: WatchdogKey, attempts: u32 },
}

/// Counters shared by the controller, every loop and the orchestrator.
#[derive(Debug)]
pub struct WatchdogMetrics {
    /// Loops spawned.
    watchdogs_started: AtomicU64,
    /// Loops stopped, gracefully or not.
    watchdogs_stopped: AtomicU64,
    /// Reconnector invocations.
    reconnect_attempts: AtomicU64,
    reconnect_successes: AtomicU64,
    reconnect_failures: AtomicU64,
    /// Reconnects interrupted by a stop signal.
    reconnects_aborted: AtomicU64,
    /// Transitions into the exhausted phase.
    exhausted: AtomicU64,
    /// Loops that missed the join timeout and were aborted.
    forced_cancellations: AtomicU64,
    started_at: Instant,
    event_sender: broadcast::Sender<WatchdogEvent>,
}

impl Default for WatchdogMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchdogMetrics {
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(256);
        Self {
            watchdogs_started: AtomicU64::new(0),
            watchdogs_stopped: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            reconnect_successes: AtomicU64::new(0),
            reconnect_failures: AtomicU64::new(0),
            reconnects_aborted: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            forced_cancellations: AtomicU64::new(0),
            started_at: Instant::now(),
            event_sender,
        }
    }

    /// Subscribe to watchdog events.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.event_sender.subscribe()
    }

    fn emit(&self, event: WatchdogEvent) {
        // No subscribers is fine.
        let _ = self.event_sender.send(event);
    }

    pub fn record_started(&self, key: &WatchdogKey) {
        self.watchdogs_started.fetch_add(1, Ordering::Relaxed);
        self.emit(WatchdogEvent::Started { key: key.clone() });
    }

    pub fn record_stopped(&self, key: &WatchdogKey, forced: bool) {
        self.watchdogs_stopped.fetch_add(1, Ordering::Relaxed);
        if forced {
            self.forced_cancellations.fetch_add(1, Ordering::Relaxed);
        }
        self.emit(WatchdogEvent::Stopped {
            key: key.clone(),
            forced,
        });
    }

    pub fn record_connected(&self, key: &WatchdogKey) {
        self.emit(WatchdogEvent::Connected { key: key.clone() });
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_success(&self, key: &WatchdogKey) {
        self.reconnect_successes.fetch_add(1, Ordering::Relaxed);
        self.emit(WatchdogEvent::Reconnected { key: key.clone() });
    }

    pub fn record_reconnect_failure(&self, key: &WatchdogKey, attempts: u32, aborted: bool) {
        self.reconnect_failures.fetch_add(1, Ordering::Relaxed);
        if aborted {
            self.reconnects_aborted.fetch_add(1, Ordering::Relaxed);
        }
        self.emit(WatchdogEvent::ReconnectFailed {
            key: key.clone(),
            attempts,
        });
    }

    pub fn record_exhausted(&self, key: &WatchdogKey, attempts: u32) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
        self.emit(WatchdogEvent::Exhausted {
            key: key.clone(),
            attempts,
        });
    }

    pub fn forced_cancellations(&self) -> u64 {
        self.forced_cancellations.load(Ordering::Relaxed)
    }

    /// Number of loops currently alive.
    pub fn active(&self) -> u64 {
        self.watchdogs_started
            .load(Ordering::Relaxed)
            .saturating_sub(self.watchdogs_stopped.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> WatchdogMetricsSnapshot {
        WatchdogMetricsSnapshot {
            watchdogs_started: self.watchdogs_started.load(Ordering::Relaxed),
            watchdogs_stopped: self.watchdogs_stopped.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnect_successes: self.reconnect_successes.load(Ordering::Relaxed),
            reconnect_failures: self.reconnect_failures.load(Ordering::Relaxed),
            reconnects_aborted: self.reconnects_aborted.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            forced_cancellations: self.forced_cancellations.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

/// A snapshot of watchdog metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogMetricsSnapshot {
    pub watchdogs_started: u64,
    pub watchdogs_stopped: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub reconnect_failures: u64,
    pub reconnects_aborted: u64,
    pub exhausted: u64,
    pub forced_cancellations: u64,
    pub uptime: Duration,
}

impl WatchdogMetricsSnapshot {
    /// Share of reconnect attempts that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.reconnect_attempts == 0 {
            0.0
        } else {
            self.reconnect_successes as f64 / self.reconnect_attempts as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_graph::EndpointRole;

    #[test]
    fn test_counters() {
        let metrics = WatchdogMetrics::new();
        let key = WatchdogKey::new("cam-1", EndpointRole::Source);

        metrics.record_started(&key);
        metrics.record_reconnect_attempt();
        metrics.record_reconnect_failure(&key, 1, true);
        metrics.record_reconnect_attempt();
        metrics.record_reconnect_success(&key);
        assert_eq!(metrics.active(), 1);

        metrics.record_stopped(&key, true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.watchdogs_started, 1);
        assert_eq!(snapshot.watchdogs_stopped, 1);
        assert_eq!(snapshot.reconnect_attempts, 2);
        assert_eq!(snapshot.reconnects_aborted, 1);
        assert_eq!(snapshot.forced_cancellations, 1);
        assert_eq!(snapshot.success_rate(), 0.5);
        assert_eq!(metrics.active(), 0);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let metrics = WatchdogMetrics::new();
        let mut events = metrics.subscribe();
        let key = WatchdogKey::new("cam-1", EndpointRole::Destination);

        metrics.record_exhausted(&key, 10);

        assert_eq!(
            events.recv().await.unwrap(),
            WatchdogEvent::Exhausted { key, attempts: 10 }
        );
    }
}
