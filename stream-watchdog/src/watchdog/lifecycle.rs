//! Watchdog lifecycle management.
//!
//! The [`LifecycleController`] owns the record store and is the only place
//! loops are spawned or torn down. Start and stop for one key are serialized
//! by a per-key lock, so at most one loop is ever alive per key.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use pipeline_graph::{EndpointRole, InstanceState, PipelineGraph, StageRole};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use super::activity::ActivityTracker;
use super::adapter::Reconnector;
use super::error::WatchdogError;
use super::metrics::WatchdogMetrics;
use super::monitor::{LoopExit, WatchdogContext, WatchdogLoop};
use super::reconnect::ReconnectOrchestrator;
use super::record::{RecordSnapshot, WatchdogKey, WatchdogPhase, WatchdogRecord, WatchdogStore};
use crate::config::WatchdogConfig;

/// How a watchdog was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// No watchdog was running for the key.
    NotRunning,
    /// The loop observed the stop signal and exited.
    Joined,
    /// The loop missed the join timeout and was aborted.
    Aborted,
}

/// Serializable view of one watchdog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchdogStatus {
    pub instance_id: String,
    pub role: EndpointRole,
    pub phase: WatchdogPhase,
    pub generation: u64,
    pub has_connected: bool,
    pub reconnect_attempts: u32,
    pub secs_since_start: f64,
    pub secs_since_activity: Option<f64>,
    pub secs_since_reconnect_attempt: Option<f64>,
    pub secs_since_successful_reconnect: Option<f64>,
}

impl WatchdogStatus {
    fn from_snapshot(snapshot: RecordSnapshot, now: Instant) -> Self {
        let since =
            |at: Option<Instant>| at.map(|at| now.saturating_duration_since(at).as_secs_f64());
        Self {
            secs_since_start: snapshot.since_start(now).as_secs_f64(),
            secs_since_activity: since(snapshot.last_activity),
            secs_since_reconnect_attempt: since(snapshot.last_reconnect_attempt),
            secs_since_successful_reconnect: since(snapshot.last_successful_reconnect),
            instance_id: snapshot.key.instance_id,
            role: snapshot.key.role,
            phase: snapshot.phase,
            generation: snapshot.generation,
            has_connected: snapshot.has_connected,
            reconnect_attempts: snapshot.reconnect_attempts,
        }
    }
}

/// Starts, stops and inspects watchdog loops.
pub struct LifecycleController {
    ctx: WatchdogContext,
    graph: Arc<dyn PipelineGraph>,
    key_locks: Arc<KeyLocks>,
}

type KeyLocks = DashMap<WatchdogKey, Arc<Mutex<()>>>;

/// Drop the key's lock once nobody holds it and no record is left.
fn release_key_lock(locks: &KeyLocks, store: &WatchdogStore, key: &WatchdogKey) {
    locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1 && !store.contains(key));
}

impl LifecycleController {
    /// Create a controller around an existing store and reconnector.
    pub fn new(
        config: WatchdogConfig,
        store: WatchdogStore,
        graph: Arc<dyn PipelineGraph>,
        instances: Arc<dyn InstanceState>,
        reconnector: Arc<dyn Reconnector>,
    ) -> Self {
        Self {
            ctx: WatchdogContext {
                store,
                config: Arc::new(config),
                reconnector,
                instances,
                metrics: Arc::new(WatchdogMetrics::new()),
            },
            graph,
            key_locks: Arc::new(DashMap::new()),
        }
    }

    /// Create a controller that recovers endpoints through a
    /// [`ReconnectOrchestrator`] on `pipeline`.
    pub fn for_pipeline<P>(
        config: WatchdogConfig,
        pipeline: Arc<P>,
        mutation_lock: Arc<Mutex<()>>,
    ) -> Self
    where
        P: PipelineGraph + InstanceState,
    {
        let store = WatchdogStore::new();
        let orchestrator = ReconnectOrchestrator::new(
            pipeline.clone(),
            pipeline.clone(),
            mutation_lock,
            ActivityTracker::new(store.clone()),
            config.reconnect.clone(),
        );
        Self::new(
            config,
            store,
            pipeline.clone(),
            pipeline,
            Arc::new(orchestrator),
        )
    }

    /// Handle for the media hot path.
    pub fn tracker(&self) -> ActivityTracker {
        ActivityTracker::new(self.ctx.store.clone())
    }

    pub fn metrics(&self) -> Arc<WatchdogMetrics> {
        self.ctx.metrics.clone()
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.ctx.config
    }

    /// Whether a watchdog is currently registered for the key.
    pub fn is_watching(&self, instance_id: &str, role: EndpointRole) -> bool {
        self.ctx.store.contains(&WatchdogKey::new(instance_id, role))
    }

    fn key_lock(&self, key: &WatchdogKey) -> Arc<Mutex<()>> {
        self.key_locks.entry(key.clone()).or_default().clone()
    }

    /// Start supervising an endpoint, replacing any loop already running
    /// for it.
    pub async fn start(&self, instance_id: &str, role: EndpointRole) {
        let key = WatchdogKey::new(instance_id, role);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        if self.stop_locked(&key).await != StopOutcome::NotRunning {
            debug!(key = %key, "Replaced running watchdog");
        }

        let generation = self.ctx.store.next_generation();
        let record = WatchdogRecord::new(key.clone(), generation, Instant::now());
        let watchdog = WatchdogLoop::new(self.ctx.clone(), &record);
        self.ctx.store.insert(record);

        let span = info_span!("watchdog", key = %key);
        let locks = self.key_locks.clone();
        let store = self.ctx.store.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(
            async move {
                if watchdog.run().await == LoopExit::InstanceGone {
                    release_key_lock(&locks, &store, &task_key);
                }
            }
            .instrument(span),
        );
        self.ctx
            .store
            .update_generation(&key, generation, |record| record.task = Some(handle));

        self.ctx.metrics.record_started(&key);
        info!(
            key = %key,
            generation,
            watching = self.ctx.store.len(),
            "Watchdog registered"
        );
    }

    /// Stop supervising an endpoint and drop all of its state.
    pub async fn stop(&self, instance_id: &str, role: EndpointRole) -> StopOutcome {
        let key = WatchdogKey::new(instance_id, role);
        let outcome = {
            let lock = self.key_lock(&key);
            let _guard = lock.lock().await;
            self.stop_locked(&key).await
        };
        release_key_lock(&self.key_locks, &self.ctx.store, &key);
        outcome
    }

    async fn stop_locked(&self, key: &WatchdogKey) -> StopOutcome {
        let Some((generation, stop, task)) = self
            .ctx
            .store
            .update(key, |record| {
                (record.generation, record.stop.clone(), record.task.take())
            })
        else {
            return StopOutcome::NotRunning;
        };

        stop.cancel();
        let join_timeout = self.ctx.config.join_timeout;
        let outcome = match task {
            Some(mut task) => match tokio::time::timeout(join_timeout, &mut task).await {
                Ok(_) => StopOutcome::Joined,
                Err(_) => {
                    task.abort();
                    warn!(
                        key = %key,
                        timeout_ms = join_timeout.as_millis() as u64,
                        "Watchdog did not stop in time, aborted"
                    );
                    StopOutcome::Aborted
                }
            },
            None => StopOutcome::Joined,
        };

        // A loop that exited on its own has already removed and counted itself.
        let removed = self.ctx.store.remove_if_generation(key, generation);
        if removed || outcome == StopOutcome::Aborted {
            self.ctx
                .metrics
                .record_stopped(key, outcome == StopOutcome::Aborted);
        }
        info!(key = %key, ?outcome, "Watchdog stopped");
        outcome
    }

    /// Start a watchdog for every endpoint the instance has.
    ///
    /// A source is supervised when the graph has a source stage or a source
    /// endpoint is configured; a destination needs both a destination stage
    /// and its endpoint configuration, since recovery rebuilds it from that.
    pub async fn start_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<EndpointRole>, WatchdogError> {
        let stages = self.graph.stages(instance_id).await?;
        let has_stage =
            |role: StageRole| stages.iter().any(|stage| self.graph.role_of(stage) == role);
        let has_source = has_stage(StageRole::Source);
        let has_destination = has_stage(StageRole::Destination);

        let mut roles = Vec::new();
        if has_source
            || self
                .ctx
                .instances
                .endpoint_config(instance_id, EndpointRole::Source)
                .await
                .is_some()
        {
            roles.push(EndpointRole::Source);
        }
        if has_destination
            && self
                .ctx
                .instances
                .endpoint_config(instance_id, EndpointRole::Destination)
                .await
                .is_some()
        {
            roles.push(EndpointRole::Destination);
        }

        if roles.is_empty() {
            debug!(instance_id, "No network endpoints to supervise");
        }
        for role in &roles {
            self.start(instance_id, *role).await;
        }
        Ok(roles)
    }

    /// Stop every watchdog of an instance.
    pub async fn stop_instance(&self, instance_id: &str) {
        for role in EndpointRole::ALL {
            self.stop(instance_id, role).await;
        }
    }

    /// Tear down and recreate every watchdog of an instance.
    pub async fn restart_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<EndpointRole>, WatchdogError> {
        self.stop_instance(instance_id).await;
        self.start_instance(instance_id).await
    }

    /// Clear the reconnect counter, lifting an exhausted watchdog.
    ///
    /// Returns false when no watchdog exists for the key.
    pub fn reset_attempts(&self, instance_id: &str, role: EndpointRole) -> bool {
        let key = WatchdogKey::new(instance_id, role);
        let previous = self.ctx.store.update(&key, |record| {
            let previous = record.reconnect_attempts;
            record.reconnect_attempts = 0;
            if record.phase == WatchdogPhase::Exhausted {
                record.phase = WatchdogPhase::SuspectedDisconnected;
            }
            previous
        });
        match previous {
            Some(previous) => {
                info!(key = %key, previous, "Reconnect attempts reset");
                true
            }
            None => false,
        }
    }

    pub fn status(&self, instance_id: &str, role: EndpointRole) -> Option<WatchdogStatus> {
        let now = Instant::now();
        self.ctx
            .store
            .snapshot(&WatchdogKey::new(instance_id, role))
            .map(|snapshot| WatchdogStatus::from_snapshot(snapshot, now))
    }

    /// Status of every watchdog, ordered by instance and role.
    pub fn statuses(&self) -> Vec<WatchdogStatus> {
        let now = Instant::now();
        self.ctx
            .store
            .snapshots()
            .into_iter()
            .map(|snapshot| WatchdogStatus::from_snapshot(snapshot, now))
            .collect()
    }

    /// Stop every watchdog.
    pub async fn shutdown(&self) {
        if self.ctx.store.is_empty() {
            debug!("No watchdogs to stop");
            return;
        }
        let keys = self.ctx.store.keys();
        info!(count = keys.len(), "Stopping all watchdogs");
        for key in keys {
            self.stop(&key.instance_id, key.role).await;
        }
    }

    /// Bound on joining a stopped loop.
    pub fn join_timeout(&self) -> Duration {
        self.ctx.config.join_timeout
    }
}
