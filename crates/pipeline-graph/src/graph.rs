//! Collaborator traits consumed by the watchdog.
//!
//! Implementations own the real pipeline graph and the instance registry.
//! Every method takes its own internal lock and releases it before returning,
//! so callers can order these calls against their own locks.

use async_trait::async_trait;

use crate::{EndpointConfig, EndpointRole, GraphError, StageHandle, StageRole};

/// Access to an instance's live pipeline graph.
///
/// Blocking operations (`stop`, `start`, `detach`, `attach`) may take
/// arbitrarily long in a real pipeline; callers wrap them in their own
/// timeouts.
#[async_trait]
pub trait PipelineGraph: Send + Sync + 'static {
    /// Ordered list of stages registered for an instance.
    async fn stages(&self, instance_id: &str) -> Result<Vec<StageHandle>, GraphError>;

    /// Role of a stage. Unknown stages report [`StageRole::Other`].
    fn role_of(&self, stage: &StageHandle) -> StageRole;

    /// Stop a stage in place, keeping its links.
    async fn stop(&self, stage: &StageHandle) -> Result<(), GraphError>;

    /// Start a previously stopped stage.
    async fn start(&self, stage: &StageHandle) -> Result<(), GraphError>;

    /// Detach a stage from its parent so nothing feeds it anymore.
    async fn detach(&self, stage: &StageHandle) -> Result<(), GraphError>;

    /// Build a new, unattached stage for an instance.
    async fn construct(
        &self,
        instance_id: &str,
        role: StageRole,
        config: &EndpointConfig,
        name: &str,
    ) -> Result<StageHandle, GraphError>;

    /// Attach `stage` downstream of `parent`.
    async fn attach(&self, stage: &StageHandle, parent: &StageHandle) -> Result<(), GraphError>;

    /// Atomically drop `stale` from the instance's stage list and register
    /// `fresh` in their place.
    async fn replace_stages(
        &self,
        instance_id: &str,
        stale: &[StageHandle],
        fresh: StageHandle,
    ) -> Result<(), GraphError>;
}

/// Read access to the instance registry.
#[async_trait]
pub trait InstanceState: Send + Sync + 'static {
    /// Whether the instance exists and is running.
    async fn is_running(&self, instance_id: &str) -> bool;

    /// Configuration needed to rebuild the endpoint stage for `role`.
    async fn endpoint_config(&self, instance_id: &str, role: EndpointRole)
    -> Option<EndpointConfig>;
}
