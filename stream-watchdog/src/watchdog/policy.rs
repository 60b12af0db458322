//! Liveness assessment.
//!
//! A pure function of a record snapshot, the configured thresholds and the
//! current time. The polling loop decides what to do with the result.

use std::time::Duration;

use pipeline_graph::EndpointRole;
use tokio::time::Instant;

use super::record::RecordSnapshot;
use crate::config::{RoleTimeouts, WatchdogConfig};

/// Outcome of one liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    /// No activity yet, still inside the initial connection window.
    InitialConnecting { waited: Duration },
    /// Activity is recent enough.
    Healthy,
    /// Silent past a threshold, but a recent reconnect is still settling.
    GracePeriod { remaining: Duration },
    /// Silent, but the paired source is stalled too; the failure is upstream.
    Deferred,
    /// Silent past a threshold.
    Disconnected { silent_for: Duration, early: bool },
}

/// Assess one endpoint.
///
/// `source` is the paired source snapshot and is only consulted for
/// destinations.
pub fn assess(
    config: &WatchdogConfig,
    snapshot: &RecordSnapshot,
    source: Option<&RecordSnapshot>,
    now: Instant,
) -> Assessment {
    let timeouts = config.timeouts(snapshot.key.role);
    let since_start = snapshot.since_start(now);

    if !snapshot.has_connected && since_start < timeouts.initial_connection {
        return Assessment::InitialConnecting {
            waited: since_start,
        };
    }

    let silent_for = snapshot.silent_for(now);
    // Never connected here means the initial window has already passed.
    let timed_out = !snapshot.has_connected || silent_for > timeouts.post_connection;

    let early = !timed_out
        && snapshot.has_connected
        && snapshot.last_activity.is_some()
        && timeouts
            .early_detection
            .is_some_and(|threshold| silent_for > threshold);

    if !timed_out && !early {
        return Assessment::Healthy;
    }

    if let Some(succeeded_at) = snapshot.last_successful_reconnect {
        let since_success = now.saturating_duration_since(succeeded_at);
        if since_success < timeouts.grace_period {
            return Assessment::GracePeriod {
                remaining: timeouts.grace_period - since_success,
            };
        }
    }

    if snapshot.key.role == EndpointRole::Destination
        && source.is_some_and(|source| is_stalled(&config.source, source, now))
    {
        return Assessment::Deferred;
    }

    Assessment::Disconnected { silent_for, early }
}

/// Whether an endpoint is past its own full timeout.
fn is_stalled(timeouts: &RoleTimeouts, snapshot: &RecordSnapshot, now: Instant) -> bool {
    if snapshot.has_connected {
        snapshot.silent_for(now) > timeouts.post_connection
    } else {
        snapshot.since_start(now) >= timeouts.initial_connection
    }
}
