//! stream-watchdog library crate.
//!
//! Per-(instance, endpoint) liveness monitoring and automatic reconnection for
//! long-running media pipelines. The hot media path reports activity through
//! [`watchdog::ActivityTracker`]; [`watchdog::LifecycleController`] runs one
//! watchdog task per endpoint and replaces dead stages through the
//! [`pipeline_graph::PipelineGraph`] collaborator.

pub mod config;
pub mod error;
pub mod logging;
pub mod watchdog;

#[cfg(test)]
mod test_utils;

pub use config::WatchdogConfig;
pub use error::{Error, Result};
