//! # Pipeline Graph
//!
//! This crate defines the boundary between the stream watchdog and the live
//! media pipeline it supervises. The watchdog never knows concrete stage
//! types; it only sees opaque [`StageHandle`]s and asks the graph for their
//! [`StageRole`].
//!
//! ## Features
//!
//! - [`PipelineGraph`]: stage lookup, stop/start/detach, construction, attach
//!   and atomic stage-list swaps
//! - [`InstanceState`]: running flag and endpoint configuration per instance
//! - [`MemoryPipeline`]: an in-memory implementation of both traits with fault
//!   injection, used by tests and simulations
//!
//! ## License
//!
//! MIT License
//!

use thiserror::Error;

mod graph;
pub mod memory;
mod stage;
#[cfg(test)]
mod test_utils;

pub use graph::{InstanceState, PipelineGraph};
pub use memory::{MemoryPipeline, StageOp};
pub use stage::{EndpointConfig, EndpointRole, StageHandle, StageRole};

/// Common error type for pipeline graph operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Stage {stage} failed to {operation}: {message}")]
    Operation {
        stage: String,
        operation: &'static str,
        message: String,
    },
}

impl GraphError {
    pub fn operation(
        stage: &StageHandle,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::Operation {
            stage: stage.name().to_string(),
            operation,
            message: message.into(),
        }
    }
}
