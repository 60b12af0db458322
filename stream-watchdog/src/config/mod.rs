//! Watchdog configuration.
//!
//! Defaults match the timings that proved stable for RTMP-style ingest and
//! egress. Every value can be overridden from the environment
//! (see [`WatchdogConfig::from_env`]); overrides are bounded.

mod env;

use std::time::Duration;

use pipeline_graph::EndpointRole;

use crate::{Error, Result};

/// Default interval between watchdog polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default maximum consecutive failed reconnects before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Default minimum time between two reconnect attempts.
pub const DEFAULT_RECONNECT_COOLDOWN: Duration = Duration::from_secs(10);

/// Default bound on joining a stopped watchdog task.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for any timeout override, in milliseconds (10 minutes).
const MAX_TIMEOUT_MS: u64 = 600_000;

/// Upper bound for any per-step delay override, in milliseconds.
const MAX_STEP_MS: u64 = 60_000;

/// Liveness thresholds for one endpoint role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTimeouts {
    /// Silence tolerated before the first activity is ever seen.
    pub initial_connection: Duration,
    /// Silence tolerated once the endpoint has connected.
    pub post_connection: Duration,
    /// Shorter threshold applied when activity stops after a healthy run.
    pub early_detection: Option<Duration>,
    /// Window after a successful reconnect during which silence is tolerated.
    pub grace_period: Duration,
}

impl RoleTimeouts {
    /// Source defaults: slow initial handshake, no early path.
    pub fn source_defaults() -> Self {
        Self {
            initial_connection: Duration::from_secs(60),
            post_connection: Duration::from_secs(15),
            early_detection: None,
            grace_period: Duration::ZERO,
        }
    }

    /// Destination defaults: write failures surface as silence quickly.
    pub fn destination_defaults() -> Self {
        Self {
            initial_connection: Duration::from_secs(30),
            post_connection: Duration::from_secs(20),
            early_detection: Some(Duration::from_secs(10)),
            grace_period: Duration::from_secs(30),
        }
    }

    fn from_lookup<F>(lookup: &F, prefix: &str, defaults: Self) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            initial_connection: env::millis(
                lookup,
                &format!("{prefix}_INITIAL_TIMEOUT_MS"),
                defaults.initial_connection,
                1_000,
                MAX_TIMEOUT_MS,
            ),
            post_connection: env::millis(
                lookup,
                &format!("{prefix}_POST_TIMEOUT_MS"),
                defaults.post_connection,
                1_000,
                MAX_TIMEOUT_MS,
            ),
            early_detection: env::optional_millis(
                lookup,
                &format!("{prefix}_EARLY_THRESHOLD_MS"),
                defaults.early_detection,
                MAX_TIMEOUT_MS,
            ),
            grace_period: env::millis(
                lookup,
                &format!("{prefix}_GRACE_PERIOD_MS"),
                defaults.grace_period,
                0,
                MAX_TIMEOUT_MS,
            ),
        }
    }
}

/// Bounds and fixed delays used while recovering a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectTimings {
    /// Bound on stopping a source stage in place.
    pub stop_timeout: Duration,
    /// Bound on every graph call other than a source stop.
    pub stage_op_timeout: Duration,
    /// Wait after stopping a source before restarting it.
    pub source_stabilization: Duration,
    /// Wait after restarting a source before the liveness clock resumes.
    pub source_initialization: Duration,
    /// Wait after detaching destinations for queued items to drain.
    pub destination_drain: Duration,
}

impl Default for ReconnectTimings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(5),
            stage_op_timeout: Duration::from_secs(5),
            source_stabilization: Duration::from_secs(2),
            source_initialization: Duration::from_secs(3),
            destination_drain: Duration::from_secs(3),
        }
    }
}

/// Complete watchdog configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub poll_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_cooldown: Duration,
    pub join_timeout: Duration,
    pub source: RoleTimeouts,
    pub destination: RoleTimeouts,
    pub reconnect: ReconnectTimings,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_cooldown: DEFAULT_RECONNECT_COOLDOWN,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            source: RoleTimeouts::source_defaults(),
            destination: RoleTimeouts::destination_defaults(),
            reconnect: ReconnectTimings::default(),
        }
    }
}

impl WatchdogConfig {
    /// Build the configuration from `WATCHDOG_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let step = |name: &str, default: Duration, min_ms: u64| {
            env::millis(&lookup, name, default, min_ms, MAX_STEP_MS)
        };

        Self {
            poll_interval: step("WATCHDOG_POLL_INTERVAL_MS", defaults.poll_interval, 100),
            max_reconnect_attempts: env::count(
                &lookup,
                "WATCHDOG_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
                1,
                1_000,
            ),
            reconnect_cooldown: env::millis(
                &lookup,
                "WATCHDOG_RECONNECT_COOLDOWN_MS",
                defaults.reconnect_cooldown,
                0,
                MAX_TIMEOUT_MS,
            ),
            join_timeout: step("WATCHDOG_JOIN_TIMEOUT_MS", defaults.join_timeout, 100),
            source: RoleTimeouts::from_lookup(&lookup, "WATCHDOG_SOURCE", defaults.source),
            destination: RoleTimeouts::from_lookup(
                &lookup,
                "WATCHDOG_DESTINATION",
                defaults.destination,
            ),
            reconnect: ReconnectTimings {
                stop_timeout: step(
                    "WATCHDOG_STAGE_STOP_TIMEOUT_MS",
                    defaults.reconnect.stop_timeout,
                    50,
                ),
                stage_op_timeout: step(
                    "WATCHDOG_STAGE_OP_TIMEOUT_MS",
                    defaults.reconnect.stage_op_timeout,
                    50,
                ),
                source_stabilization: step(
                    "WATCHDOG_SOURCE_STABILIZATION_MS",
                    defaults.reconnect.source_stabilization,
                    0,
                ),
                source_initialization: step(
                    "WATCHDOG_SOURCE_INITIALIZATION_MS",
                    defaults.reconnect.source_initialization,
                    0,
                ),
                destination_drain: step(
                    "WATCHDOG_DESTINATION_DRAIN_MS",
                    defaults.reconnect.destination_drain,
                    0,
                ),
            },
        }
    }

    /// Thresholds for one role.
    pub fn timeouts(&self, role: EndpointRole) -> &RoleTimeouts {
        match role {
            EndpointRole::Source => &self.source,
            EndpointRole::Destination => &self.destination,
        }
    }

    /// Check cross-field constraints that bounded parsing cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll interval must be greater than zero"));
        }
        for role in EndpointRole::ALL {
            let timeouts = self.timeouts(role);
            if let Some(early) = timeouts.early_detection
                && early >= timeouts.post_connection
            {
                return Err(Error::config(format!(
                    "{role} early detection threshold ({early:?}) must be shorter than \
                     the post-connection timeout ({:?})",
                    timeouts.post_connection
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = WatchdogConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.source.initial_connection, Duration::from_secs(60));
        assert_eq!(config.source.early_detection, None);
        assert_eq!(
            config.destination.early_detection,
            Some(Duration::from_secs(10))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("WATCHDOG_POLL_INTERVAL_MS", "500"),
            ("WATCHDOG_MAX_RECONNECT_ATTEMPTS", "3"),
            ("WATCHDOG_DESTINATION_GRACE_PERIOD_MS", "0"),
            ("WATCHDOG_SOURCE_EARLY_THRESHOLD_MS", "8000"),
            ("WATCHDOG_DESTINATION_DRAIN_MS", "250"),
        ]
        .into_iter()
        .collect();

        let config = WatchdogConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.destination.grace_period, Duration::ZERO);
        assert_eq!(config.source.early_detection, Some(Duration::from_secs(8)));
        assert_eq!(config.reconnect.destination_drain, Duration::from_millis(250));
        // Untouched values keep their defaults.
        assert_eq!(config.reconnect_cooldown, DEFAULT_RECONNECT_COOLDOWN);
    }

    #[test]
    fn test_validate_rejects_early_threshold_past_timeout() {
        let mut config = WatchdogConfig::default();
        config.destination.early_detection = Some(Duration::from_secs(25));
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_timeouts_by_role() {
        let config = WatchdogConfig::default();
        assert_eq!(config.timeouts(EndpointRole::Source), &config.source);
        assert_eq!(
            config.timeouts(EndpointRole::Destination),
            &config.destination
        );
    }
}
