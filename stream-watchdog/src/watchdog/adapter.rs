//! Reconnect adapter for the watchdog loop.
//!
//! The loop decides *when* an endpoint must be recovered; a [`Reconnector`]
//! decides *how*. The production implementation is
//! [`ReconnectOrchestrator`](super::ReconnectOrchestrator); tests plug in
//! scripted implementations.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::WatchdogError;
use super::record::WatchdogKey;

/// Trait for recovering a silent endpoint.
#[async_trait]
pub trait Reconnector: Send + Sync + 'static {
    /// Recover the endpoint identified by `key`.
    ///
    /// Implementations must observe `stop` at every blocking step and return
    /// [`WatchdogError::AbortedByShutdown`] once it fires.
    async fn reconnect(&self, key: &WatchdogKey, stop: &CancellationToken)
    -> Result<(), WatchdogError>;
}
