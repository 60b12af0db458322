//! Bounded parsing of environment overrides.
//!
//! Values outside their bounds or that fail to parse are reported and replaced
//! by the default, so a typo in the environment never prevents startup.

use std::time::Duration;

use tracing::warn;

/// Parse a millisecond duration, falling back to `default` when unset or invalid.
pub(crate) fn millis<F>(
    lookup: &F,
    name: &str,
    default: Duration,
    min_ms: u64,
    max_ms: u64,
) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    match bounded(lookup, name, min_ms, max_ms) {
        Some(ms) => Duration::from_millis(ms),
        None => default,
    }
}

/// Parse an optional millisecond threshold where `0` disables it.
pub(crate) fn optional_millis<F>(
    lookup: &F,
    name: &str,
    default: Option<Duration>,
    max_ms: u64,
) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match bounded(lookup, name, 0, max_ms) {
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
        None => default,
    }
}

/// Parse a bounded count, falling back to `default` when unset or invalid.
pub(crate) fn count<F>(lookup: &F, name: &str, default: u32, min: u32, max: u32) -> u32
where
    F: Fn(&str) -> Option<String>,
{
    bounded(lookup, name, u64::from(min), u64::from(max))
        .and_then(|value| u32::try_from(value).ok())
        .unwrap_or(default)
}

fn bounded<F>(lookup: &F, name: &str, min: u64, max: u64) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(value) if (min..=max).contains(&value) => Some(value),
        Ok(value) => {
            warn!(
                name,
                value,
                min,
                max,
                "Environment override out of range, using default"
            );
            None
        }
        Err(e) => {
            warn!(name, value = %raw, error = %e, "Invalid environment override, using default");
            None
        }
    }
}
