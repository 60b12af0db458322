//! Watchdog error types.

use std::time::Duration;

use pipeline_graph::GraphError;
use thiserror::Error;

use super::WatchdogKey;

/// Errors raised while supervising or recovering an endpoint.
#[derive(Error, Debug, Clone)]
pub enum WatchdogError {
    #[error("{key}: no activity for {silent_for:?}")]
    ConnectionLost { key: WatchdogKey, silent_for: Duration },

    #[error("{key}: reconnect failed: {reason}")]
    ReconnectFailed { key: WatchdogKey, reason: String },

    #[error("{key}: reconnect aborted by shutdown during {step}")]
    AbortedByShutdown {
        key: WatchdogKey,
        step: &'static str,
    },

    #[error("{key}: giving up after {attempts} reconnect attempts")]
    MaxAttemptsExceeded { key: WatchdogKey, attempts: u32 },

    #[error("Pipeline error: {0}")]
    Graph(#[from] GraphError),
}

impl WatchdogError {
    pub fn connection_lost(key: &WatchdogKey, silent_for: Duration) -> Self {
        Self::ConnectionLost {
            key: key.clone(),
            silent_for,
        }
    }

    pub fn reconnect_failed(key: &WatchdogKey, reason: impl Into<String>) -> Self {
        Self::ReconnectFailed {
            key: key.clone(),
            reason: reason.into(),
        }
    }

    pub fn aborted(key: &WatchdogKey, step: &'static str) -> Self {
        Self::AbortedByShutdown {
            key: key.clone(),
            step,
        }
    }

    pub fn max_attempts(key: &WatchdogKey, attempts: u32) -> Self {
        Self::MaxAttemptsExceeded {
            key: key.clone(),
            attempts,
        }
    }

    /// Whether the error comes from a stop signal rather than a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::AbortedByShutdown { .. })
    }
}
