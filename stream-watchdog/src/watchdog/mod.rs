//! Stream-health watchdog.
//!
//! Every supervised endpoint (an instance's ingest source or egress
//! destination) gets its own polling task. The media hot path reports
//! transfers through an [`ActivityTracker`]; when an endpoint falls silent
//! for too long the loop asks a [`Reconnector`] to recover it.
//!
//! # Components
//!
//! - [`WatchdogStore`]: one concurrent map of [`WatchdogRecord`]s
//! - [`ActivityTracker`]: non-blocking activity reporting
//! - [`policy`]: pure liveness assessment
//! - [`ReconnectOrchestrator`]: stage recovery on the pipeline graph
//! - [`LifecycleController`]: starts, stops and inspects loops
//! - [`WatchdogMetrics`]: counters and lifecycle events
//!
//! # Phases
//!
//! ```text
//! InitialConnecting -> Connected -> SuspectedDisconnected -> Reconnecting
//!                          ^                                     |
//!                          +-------------------------------------+
//! Reconnecting -> Exhausted (attempt limit reached, until reset)
//! any phase -> Stopped
//! ```

mod activity;
mod adapter;
mod error;
mod lifecycle;
mod metrics;
mod monitor;
pub mod policy;
mod reconnect;
mod record;

pub use activity::ActivityTracker;
pub use adapter::Reconnector;
pub use error::WatchdogError;
pub use lifecycle::{LifecycleController, StopOutcome, WatchdogStatus};
pub use metrics::{WatchdogEvent, WatchdogMetrics, WatchdogMetricsSnapshot};
pub use policy::Assessment;
pub use reconnect::ReconnectOrchestrator;
pub use record::{RecordSnapshot, WatchdogKey, WatchdogPhase, WatchdogRecord, WatchdogStore};
