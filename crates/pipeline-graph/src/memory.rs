//! # In-memory pipeline
//!
//! [`MemoryPipeline`] implements both [`PipelineGraph`] and [`InstanceState`]
//! over plain maps. It models what the watchdog relies on from a real
//! pipeline: stages with a parent link, a started flag, an ordered stage list
//! per instance, and operations that can fail or hang.
//!
//! Every call is recorded as a [`StageOp`] so callers can assert on the exact
//! sequence of graph mutations.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::{
    EndpointConfig, EndpointRole, GraphError, InstanceState, PipelineGraph, StageHandle, StageRole,
};

/// A recorded graph operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOp {
    Stop(StageHandle),
    Start(StageHandle),
    Detach(StageHandle),
    Construct(StageHandle),
    Attach {
        stage: StageHandle,
        parent: StageHandle,
    },
    Replace {
        instance_id: String,
        removed: usize,
        added: StageHandle,
    },
}

#[derive(Debug, Clone)]
struct StageEntry {
    role: StageRole,
    started: bool,
    parent: Option<StageHandle>,
}

#[derive(Debug, Default)]
struct InstanceEntry {
    running: bool,
    stages: Vec<StageHandle>,
    endpoints: HashMap<EndpointRole, EndpointConfig>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_starts: u32,
    failing_attaches: u32,
    stop_delay: Option<Duration>,
    construct_delay: Option<Duration>,
    attach_delay: Option<Duration>,
}

/// In-memory pipeline graph and instance registry.
#[derive(Debug, Default)]
pub struct MemoryPipeline {
    instances: RwLock<HashMap<String, InstanceEntry>>,
    stages: RwLock<HashMap<StageHandle, StageEntry>>,
    faults: Mutex<Faults>,
    ops: Mutex<Vec<StageOp>>,
}

impl MemoryPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running instance with an empty graph.
    pub fn add_instance(&self, instance_id: impl Into<String>) {
        self.instances.write().insert(
            instance_id.into(),
            InstanceEntry {
                running: true,
                ..Default::default()
            },
        );
    }

    /// Remove an instance. Its stages stay resolvable but are no longer listed.
    pub fn remove_instance(&self, instance_id: &str) {
        self.instances.write().remove(instance_id);
    }

    pub fn set_running(&self, instance_id: &str, running: bool) {
        if let Some(entry) = self.instances.write().get_mut(instance_id) {
            entry.running = running;
        }
    }

    pub fn set_endpoint(&self, instance_id: &str, role: EndpointRole, config: EndpointConfig) {
        if let Some(entry) = self.instances.write().get_mut(instance_id) {
            entry.endpoints.insert(role, config);
        }
    }

    /// Add a started stage to an instance, optionally linked under `parent`.
    pub fn add_stage(
        &self,
        instance_id: &str,
        name: &str,
        role: StageRole,
        parent: Option<&StageHandle>,
    ) -> StageHandle {
        let handle = StageHandle::new(name);
        self.stages.write().insert(
            handle.clone(),
            StageEntry {
                role,
                started: true,
                parent: parent.cloned(),
            },
        );
        if let Some(entry) = self.instances.write().get_mut(instance_id) {
            entry.stages.push(handle.clone());
        }
        handle
    }

    /// Make the next `count` calls to `start` fail.
    pub fn fail_next_starts(&self, count: u32) {
        self.faults.lock().failing_starts = count;
    }

    /// Make the next `count` calls to `attach` fail.
    pub fn fail_next_attaches(&self, count: u32) {
        self.faults.lock().failing_attaches = count;
    }

    /// Make every `stop` call take `delay` before completing.
    pub fn hang_stops(&self, delay: Duration) {
        self.faults.lock().stop_delay = Some(delay);
    }

    /// Make every `construct` call take `delay` before the stage exists.
    pub fn hang_constructs(&self, delay: Duration) {
        self.faults.lock().construct_delay = Some(delay);
    }

    /// Make every `attach` call link the stage, then take `delay` before
    /// replying.
    pub fn hang_attaches(&self, delay: Duration) {
        self.faults.lock().attach_delay = Some(delay);
    }

    /// Drop every injected fault.
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Stages currently fed by `parent`.
    pub fn children_of(&self, parent: &StageHandle) -> Vec<StageHandle> {
        let mut children: Vec<StageHandle> = self
            .stages
            .read()
            .iter()
            .filter(|(_, entry)| entry.parent.as_ref() == Some(parent))
            .map(|(handle, _)| handle.clone())
            .collect();
        children.sort();
        children
    }

    pub fn is_started(&self, stage: &StageHandle) -> bool {
        self.stages
            .read()
            .get(stage)
            .map(|entry| entry.started)
            .unwrap_or(false)
    }

    /// Number of listed stages with `role` for an instance.
    pub fn count_role(&self, instance_id: &str, role: StageRole) -> usize {
        let listed = self
            .instances
            .read()
            .get(instance_id)
            .map(|entry| entry.stages.clone())
            .unwrap_or_default();
        listed
            .iter()
            .filter(|stage| self.role_of(stage) == role)
            .count()
    }

    /// Snapshot of every recorded operation, oldest first.
    pub fn operations(&self) -> Vec<StageOp> {
        self.ops.lock().clone()
    }

    fn record(&self, op: StageOp) {
        debug!(?op, "Pipeline operation");
        self.ops.lock().push(op);
    }

    fn update_stage<F>(&self, stage: &StageHandle, f: F) -> Result<(), GraphError>
    where
        F: FnOnce(&mut StageEntry),
    {
        let mut stages = self.stages.write();
        let entry = stages
            .get_mut(stage)
            .ok_or_else(|| GraphError::StageNotFound(stage.name().to_string()))?;
        f(entry);
        Ok(())
    }
}

#[async_trait]
impl PipelineGraph for MemoryPipeline {
    async fn stages(&self, instance_id: &str) -> Result<Vec<StageHandle>, GraphError> {
        self.instances
            .read()
            .get(instance_id)
            .map(|entry| entry.stages.clone())
            .ok_or_else(|| GraphError::InstanceNotFound(instance_id.to_string()))
    }

    fn role_of(&self, stage: &StageHandle) -> StageRole {
        self.stages
            .read()
            .get(stage)
            .map(|entry| entry.role)
            .unwrap_or(StageRole::Other)
    }

    async fn stop(&self, stage: &StageHandle) -> Result<(), GraphError> {
        let delay = self.faults.lock().stop_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.update_stage(stage, |entry| entry.started = false)?;
        self.record(StageOp::Stop(stage.clone()));
        Ok(())
    }

    async fn start(&self, stage: &StageHandle) -> Result<(), GraphError> {
        {
            let mut faults = self.faults.lock();
            if faults.failing_starts > 0 {
                faults.failing_starts -= 1;
                return Err(GraphError::operation(stage, "start", "injected failure"));
            }
        }
        self.update_stage(stage, |entry| entry.started = true)?;
        self.record(StageOp::Start(stage.clone()));
        Ok(())
    }

    async fn detach(&self, stage: &StageHandle) -> Result<(), GraphError> {
        self.update_stage(stage, |entry| {
            entry.parent = None;
            entry.started = false;
        })?;
        self.record(StageOp::Detach(stage.clone()));
        Ok(())
    }

    async fn construct(
        &self,
        instance_id: &str,
        role: StageRole,
        _config: &EndpointConfig,
        name: &str,
    ) -> Result<StageHandle, GraphError> {
        let delay = self.faults.lock().construct_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.instances.read().contains_key(instance_id) {
            return Err(GraphError::InstanceNotFound(instance_id.to_string()));
        }
        let handle = StageHandle::new(name);
        self.stages.write().insert(
            handle.clone(),
            StageEntry {
                role,
                started: false,
                parent: None,
            },
        );
        self.record(StageOp::Construct(handle.clone()));
        Ok(handle)
    }

    async fn attach(&self, stage: &StageHandle, parent: &StageHandle) -> Result<(), GraphError> {
        let delay = {
            let mut faults = self.faults.lock();
            if faults.failing_attaches > 0 {
                faults.failing_attaches -= 1;
                return Err(GraphError::operation(stage, "attach", "injected failure"));
            }
            faults.attach_delay
        };
        if !self.stages.read().contains_key(parent) {
            return Err(GraphError::StageNotFound(parent.name().to_string()));
        }
        self.update_stage(stage, |entry| {
            entry.parent = Some(parent.clone());
            entry.started = true;
        })?;
        self.record(StageOp::Attach {
            stage: stage.clone(),
            parent: parent.clone(),
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn replace_stages(
        &self,
        instance_id: &str,
        stale: &[StageHandle],
        fresh: StageHandle,
    ) -> Result<(), GraphError> {
        let removed = {
            let mut instances = self.instances.write();
            let entry = instances
                .get_mut(instance_id)
                .ok_or_else(|| GraphError::InstanceNotFound(instance_id.to_string()))?;
            let before = entry.stages.len();
            entry.stages.retain(|stage| !stale.contains(stage));
            let removed = before - entry.stages.len();
            if !entry.stages.contains(&fresh) {
                entry.stages.push(fresh.clone());
            }
            removed
        };
        self.record(StageOp::Replace {
            instance_id: instance_id.to_string(),
            removed,
            added: fresh,
        });
        Ok(())
    }
}

#[async_trait]
impl InstanceState for MemoryPipeline {
    async fn is_running(&self, instance_id: &str) -> bool {
        self.instances
            .read()
            .get(instance_id)
            .map(|entry| entry.running)
            .unwrap_or(false)
    }

    async fn endpoint_config(
        &self,
        instance_id: &str,
        role: EndpointRole,
    ) -> Option<EndpointConfig> {
        self.instances
            .read()
            .get(instance_id)
            .and_then(|entry| entry.endpoints.get(&role).cloned())
    }
}
