//! Pipeline-level endpoint recovery.
//!
//! [`ReconnectOrchestrator`] is the production [`Reconnector`]. Sources are
//! stopped and restarted in place; destinations are detached and rebuilt
//! from their endpoint configuration.
//!
//! Lock order: the instance registry (`InstanceState::is_running`, which
//! takes and releases its own lock) is always consulted *before* the shared
//! pipeline mutation lock is acquired, and never while it is held. Every
//! blocking graph call is bounded by a timeout and raced against the stop
//! token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline_graph::{
    EndpointRole, GraphError, InstanceState, PipelineGraph, StageHandle, StageRole,
};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::activity::ActivityTracker;
use super::adapter::Reconnector;
use super::error::WatchdogError;
use super::record::WatchdogKey;
use crate::config::ReconnectTimings;

/// Recovers endpoints by mutating the instance's pipeline graph.
pub struct ReconnectOrchestrator {
    graph: Arc<dyn PipelineGraph>,
    instances: Arc<dyn InstanceState>,
    mutation_lock: Arc<Mutex<()>>,
    tracker: ActivityTracker,
    timings: ReconnectTimings,
}

impl ReconnectOrchestrator {
    /// Create an orchestrator.
    ///
    /// `mutation_lock` must be the same lock every other pipeline writer
    /// takes before changing the graph.
    pub fn new(
        graph: Arc<dyn PipelineGraph>,
        instances: Arc<dyn InstanceState>,
        mutation_lock: Arc<Mutex<()>>,
        tracker: ActivityTracker,
        timings: ReconnectTimings,
    ) -> Self {
        Self {
            graph,
            instances,
            mutation_lock,
            tracker,
            timings,
        }
    }

    async fn reconnect_source(
        &self,
        key: &WatchdogKey,
        stop: &CancellationToken,
    ) -> Result<(), WatchdogError> {
        ensure_not_stopped(key, stop, "source lookup")?;
        self.ensure_running(key, "source lookup").await?;

        let source = self
            .stage_list(key, stop, "source lookup")
            .await?
            .into_iter()
            .find(|stage| self.graph.role_of(stage) == StageRole::Source)
            .ok_or_else(|| WatchdogError::reconnect_failed(key, "no source stage in pipeline"))?;

        debug!(stage = %source, "Stopping source stage");
        let stopped = bounded(
            key,
            stop,
            "source stop",
            self.timings.stop_timeout,
            self.graph.stop(&source),
        )
        .await;
        match stopped {
            Ok(()) => {}
            Err(err) if err.is_abort() => return Err(err),
            // Restarting a stage that did not stop cleanly still recovers it.
            Err(err) => {
                warn!(stage = %source, error = %err, "Source stop incomplete, restarting anyway");
            }
        }

        pause(key, stop, self.timings.source_stabilization, "stabilization").await?;
        ensure_not_stopped(key, stop, "source restart")?;
        self.ensure_running(key, "source restart").await?;

        {
            let _guard = self.lock(key, stop, "source restart").await?;
            ensure_not_stopped(key, stop, "source restart")?;
            bounded(
                key,
                stop,
                "source start",
                self.timings.stage_op_timeout,
                self.graph.start(&source),
            )
            .await?;
        }

        pause(
            key,
            stop,
            self.timings.source_initialization,
            "source initialization",
        )
        .await?;
        self.tracker.mark_reconnected(&key.instance_id, key.role);
        info!(stage = %source, "Source stage restarted");
        Ok(())
    }

    async fn reconnect_destination(
        &self,
        key: &WatchdogKey,
        stop: &CancellationToken,
    ) -> Result<(), WatchdogError> {
        ensure_not_stopped(key, stop, "destination lookup")?;
        self.ensure_running(key, "destination lookup").await?;

        let stages = self.stage_list(key, stop, "destination lookup").await?;
        let stale: Vec<StageHandle> = stages
            .iter()
            .filter(|stage| self.graph.role_of(stage) == StageRole::Destination)
            .cloned()
            .collect();
        if stale.is_empty() {
            return Err(WatchdogError::reconnect_failed(
                key,
                "no destination stage in pipeline",
            ));
        }
        let relay = stages
            .iter()
            .find(|stage| self.graph.role_of(stage) == StageRole::Relay)
            .cloned()
            .ok_or_else(|| WatchdogError::reconnect_failed(key, "no relay stage in pipeline"))?;
        let lookup = async {
            let config = self
                .instances
                .endpoint_config(&key.instance_id, EndpointRole::Destination)
                .await;
            Ok::<_, GraphError>(config)
        };
        let config = bounded(
            key,
            stop,
            "destination config lookup",
            self.timings.stage_op_timeout,
            lookup,
        )
        .await?
        .ok_or_else(|| {
            WatchdogError::reconnect_failed(key, "no destination endpoint configuration")
        })?;

        self.ensure_running(key, "destination detach").await?;
        {
            let _guard = self.lock(key, stop, "destination detach").await?;
            ensure_not_stopped(key, stop, "destination detach")?;
            for stage in &stale {
                let detached = bounded(
                    key,
                    stop,
                    "destination detach",
                    self.timings.stage_op_timeout,
                    self.graph.detach(stage),
                )
                .await;
                match detached {
                    Ok(()) => debug!(stage = %stage, "Detached destination stage"),
                    Err(err) if err.is_abort() => return Err(err),
                    Err(err) => {
                        warn!(stage = %stage, error = %err, "Failed to detach destination stage");
                    }
                }
            }
        }

        pause(key, stop, self.timings.destination_drain, "destination drain").await?;
        ensure_not_stopped(key, stop, "destination rebuild")?;
        self.ensure_running(key, "destination rebuild").await?;

        let guard = self.lock(key, stop, "destination rebuild").await?;
        ensure_not_stopped(key, stop, "destination rebuild")?;

        let name = format!("{}-destination-{}", key.instance_id, Uuid::new_v4());
        let fresh = bounded(
            key,
            stop,
            "destination construct",
            self.timings.stage_op_timeout,
            self.graph.construct(&key.instance_id, StageRole::Destination, &config, &name),
        )
        .await?;

        ensure_not_stopped(key, stop, "destination attach")?;
        let attached = bounded(
            key,
            stop,
            "destination attach",
            self.timings.stage_op_timeout,
            self.graph.attach(&fresh, &relay),
        )
        .await;
        if let Err(err) = attached {
            // A timed-out or aborted attach may already have linked the stage.
            self.roll_back(&fresh).await;
            return Err(err);
        }

        let replaced = bounded(
            key,
            stop,
            "destination replace",
            self.timings.stage_op_timeout,
            self.graph.replace_stages(&key.instance_id, &stale, fresh.clone()),
        )
        .await;
        if let Err(err) = replaced {
            // An attached but unlisted stage would never be cleaned up.
            self.roll_back(&fresh).await;
            return Err(err);
        }
        drop(guard);

        self.tracker.mark_reconnected(&key.instance_id, key.role);
        info!(
            stage = %fresh,
            replaced = stale.len(),
            url = %config.url,
            "Destination stage rebuilt"
        );
        Ok(())
    }

    async fn stage_list(
        &self,
        key: &WatchdogKey,
        stop: &CancellationToken,
        step: &'static str,
    ) -> Result<Vec<StageHandle>, WatchdogError> {
        bounded(
            key,
            stop,
            step,
            self.timings.stage_op_timeout,
            self.graph.stages(&key.instance_id),
        )
        .await
    }

    /// Unlink a new destination that never made it into the stage list.
    ///
    /// Runs even after a stop, bounded only by the stage operation timeout.
    async fn roll_back(&self, stage: &StageHandle) {
        let limit = self.timings.stage_op_timeout;
        match tokio::time::timeout(limit, self.graph.detach(stage)).await {
            Ok(Ok(())) => debug!(stage = %stage, "Rolled back new destination stage"),
            Ok(Err(err)) => {
                warn!(stage = %stage, error = %err, "Failed to roll back new destination stage");
            }
            Err(_) => warn!(
                stage = %stage,
                timeout_ms = limit.as_millis() as u64,
                "Rolling back new destination stage timed out"
            ),
        }
    }

    async fn ensure_running(
        &self,
        key: &WatchdogKey,
        step: &'static str,
    ) -> Result<(), WatchdogError> {
        if self.instances.is_running(&key.instance_id).await {
            Ok(())
        } else {
            Err(WatchdogError::reconnect_failed(
                key,
                format!("instance not running before {step}"),
            ))
        }
    }

    async fn lock(
        &self,
        key: &WatchdogKey,
        stop: &CancellationToken,
        step: &'static str,
    ) -> Result<MutexGuard<'_, ()>, WatchdogError> {
        tokio::select! {
            biased;
            _ = stop.cancelled() => Err(WatchdogError::aborted(key, step)),
            guard = self.mutation_lock.lock() => Ok(guard),
        }
    }
}

#[async_trait]
impl Reconnector for ReconnectOrchestrator {
    async fn reconnect(
        &self,
        key: &WatchdogKey,
        stop: &CancellationToken,
    ) -> Result<(), WatchdogError> {
        match key.role {
            EndpointRole::Source => self.reconnect_source(key, stop).await,
            EndpointRole::Destination => self.reconnect_destination(key, stop).await,
        }
    }
}

fn ensure_not_stopped(
    key: &WatchdogKey,
    stop: &CancellationToken,
    step: &'static str,
) -> Result<(), WatchdogError> {
    if stop.is_cancelled() {
        Err(WatchdogError::aborted(key, step))
    } else {
        Ok(())
    }
}

/// Sleep for `delay` unless the stop token fires first.
async fn pause(
    key: &WatchdogKey,
    stop: &CancellationToken,
    delay: Duration,
    step: &'static str,
) -> Result<(), WatchdogError> {
    tokio::select! {
        biased;
        _ = stop.cancelled() => Err(WatchdogError::aborted(key, step)),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Run a graph operation under `limit`, racing it against the stop token.
async fn bounded<T, F>(
    key: &WatchdogKey,
    stop: &CancellationToken,
    step: &'static str,
    limit: Duration,
    op: F,
) -> Result<T, WatchdogError>
where
    F: Future<Output = Result<T, GraphError>> + Send,
{
    tokio::select! {
        biased;
        _ = stop.cancelled() => Err(WatchdogError::aborted(key, step)),
        result = tokio::time::timeout(limit, op) => match result {
            Ok(result) => result.map_err(WatchdogError::from),
            Err(_) => Err(WatchdogError::reconnect_failed(
                key,
                format!("{step} timed out after {limit:?}"),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::record::{WatchdogRecord, WatchdogStore};
    use pipeline_graph::{EndpointConfig, MemoryPipeline, StageOp};
    use tokio::time::Instant;

    struct Fixture {
        pipeline: Arc<MemoryPipeline>,
        tracker: ActivityTracker,
        mutation_lock: Arc<Mutex<()>>,
        orchestrator: ReconnectOrchestrator,
        source: StageHandle,
        relay: StageHandle,
    }

    fn fixture() -> Fixture {
        crate::test_utils::init_tracing();
        let pipeline = Arc::new(MemoryPipeline::new());
        pipeline.add_instance("cam-1");
        pipeline.set_endpoint(
            "cam-1",
            EndpointRole::Destination,
            EndpointConfig::new("rtmp://egress.example/live").with_channel(1),
        );
        let source = pipeline.add_stage("cam-1", "cam-1-source", StageRole::Source, None);
        let relay = pipeline.add_stage("cam-1", "cam-1-overlay", StageRole::Relay, Some(&source));
        pipeline.add_stage(
            "cam-1",
            "cam-1-destination",
            StageRole::Destination,
            Some(&relay),
        );

        let store = WatchdogStore::new();
        for role in EndpointRole::ALL {
            store.insert(WatchdogRecord::new(
                WatchdogKey::new("cam-1", role),
                store.next_generation(),
                Instant::now(),
            ));
        }
        let tracker = ActivityTracker::new(store);
        let mutation_lock = Arc::new(Mutex::new(()));
        let orchestrator = ReconnectOrchestrator::new(
            pipeline.clone(),
            pipeline.clone(),
            mutation_lock.clone(),
            tracker.clone(),
            ReconnectTimings::default(),
        );

        Fixture {
            pipeline,
            tracker,
            mutation_lock,
            orchestrator,
            source,
            relay,
        }
    }

    fn key(role: EndpointRole) -> WatchdogKey {
        WatchdogKey::new("cam-1", role)
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_restarts_in_place() {
        let f = fixture();
        let stop = CancellationToken::new();

        f.orchestrator
            .reconnect(&key(EndpointRole::Source), &stop)
            .await
            .unwrap();

        assert_eq!(
            f.pipeline.operations(),
            vec![StageOp::Stop(f.source.clone()), StageOp::Start(f.source.clone())]
        );
        assert!(f.pipeline.is_started(&f.source));
        // The relay link is kept.
        assert_eq!(f.pipeline.children_of(&f.source), vec![f.relay.clone()]);
        assert!(f.tracker.is_connected("cam-1", EndpointRole::Source));
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_hanging_stop_still_restarts() {
        let f = fixture();
        f.pipeline.hang_stops(Duration::from_secs(60));

        f.orchestrator
            .reconnect(&key(EndpointRole::Source), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            f.pipeline.operations(),
            vec![StageOp::Start(f.source.clone())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_start_failure() {
        let f = fixture();
        f.pipeline.fail_next_starts(1);

        let err = f
            .orchestrator
            .reconnect(&key(EndpointRole::Source), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, WatchdogError::Graph(GraphError::Operation { .. })));
        assert!(!f.tracker.is_connected("cam-1", EndpointRole::Source));
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_abort_during_stabilization() {
        let f = fixture();
        let stop = CancellationToken::new();
        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = f
            .orchestrator
            .reconnect(&key(EndpointRole::Source), &stop)
            .await
            .unwrap_err();

        assert!(err.is_abort());
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(f.pipeline.operations(), vec![StageOp::Stop(f.source.clone())]);
        assert!(!f.pipeline.is_started(&f.source));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_running_fails_without_mutation() {
        let f = fixture();
        f.pipeline.set_running("cam-1", false);

        for role in EndpointRole::ALL {
            let err = f
                .orchestrator
                .reconnect(&key(role), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, WatchdogError::ReconnectFailed { .. }));
        }
        assert!(f.pipeline.operations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_rebuild_converges() {
        let f = fixture();
        let stop = CancellationToken::new();

        for _ in 0..3 {
            f.orchestrator
                .reconnect(&key(EndpointRole::Destination), &stop)
                .await
                .unwrap();

            let children = f.pipeline.children_of(&f.relay);
            assert_eq!(children.len(), 1);
            assert!(children[0].name().starts_with("cam-1-destination-"));
            assert!(f.pipeline.is_started(&children[0]));
            assert_eq!(f.pipeline.count_role("cam-1", StageRole::Destination), 1);
        }
        assert!(f.tracker.is_connected("cam-1", EndpointRole::Destination));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_detaches_every_stale_stage() {
        let f = fixture();
        // A leftover from an earlier crash.
        f.pipeline.add_stage(
            "cam-1",
            "cam-1-destination-old",
            StageRole::Destination,
            Some(&f.relay),
        );

        f.orchestrator
            .reconnect(&key(EndpointRole::Destination), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(f.pipeline.children_of(&f.relay).len(), 1);
        assert_eq!(f.pipeline.count_role("cam-1", StageRole::Destination), 1);
        let replaced = f.pipeline.operations().into_iter().find_map(|op| match op {
            StageOp::Replace { removed, .. } => Some(removed),
            _ => None,
        });
        assert_eq!(replaced, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_missing_relay_fails_before_mutation() {
        let pipeline = Arc::new(MemoryPipeline::new());
        pipeline.add_instance("cam-2");
        pipeline.set_endpoint(
            "cam-2",
            EndpointRole::Destination,
            EndpointConfig::new("rtmp://egress.example/b"),
        );
        pipeline.add_stage("cam-2", "cam-2-destination", StageRole::Destination, None);
        let orchestrator = ReconnectOrchestrator::new(
            pipeline.clone(),
            pipeline.clone(),
            Arc::new(Mutex::new(())),
            ActivityTracker::new(WatchdogStore::new()),
            ReconnectTimings::default(),
        );

        let err = orchestrator
            .reconnect(
                &WatchdogKey::new("cam-2", EndpointRole::Destination),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("no relay stage"));
        assert!(pipeline.operations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_attach_failure_then_retry() {
        let f = fixture();
        f.pipeline.fail_next_attaches(1);
        let stop = CancellationToken::new();

        let err = f
            .orchestrator
            .reconnect(&key(EndpointRole::Destination), &stop)
            .await
            .unwrap_err();
        assert!(matches!(err, WatchdogError::Graph(_)));
        assert!(f.pipeline.children_of(&f.relay).is_empty());

        f.orchestrator
            .reconnect(&key(EndpointRole::Destination), &stop)
            .await
            .unwrap();
        assert_eq!(f.pipeline.children_of(&f.relay).len(), 1);
        assert_eq!(f.pipeline.count_role("cam-1", StageRole::Destination), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_abort_during_drain() {
        let f = fixture();
        let stop = CancellationToken::new();
        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = f
            .orchestrator
            .reconnect(&key(EndpointRole::Destination), &stop)
            .await
            .unwrap_err();

        assert!(err.is_abort());
        assert!(
            !f.pipeline
                .operations()
                .iter()
                .any(|op| matches!(op, StageOp::Construct(_)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_for_mutation_lock_is_abortable() {
        let f = fixture();
        let _held = f.mutation_lock.clone().lock_owned().await;
        let stop = CancellationToken::new();
        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            canceller.cancel();
        });

        let err = f
            .orchestrator
            .reconnect(&key(EndpointRole::Source), &stop)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WatchdogError::AbortedByShutdown {
                step: "source restart",
                ..
            }
        ));
        assert!(
            !f.pipeline
                .operations()
                .iter()
                .any(|op| matches!(op, StageOp::Start(_)))
        );
    }

    fn cancel_after(stop: &CancellationToken, delay: Duration) {
        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            canceller.cancel();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_late_attach_is_rolled_back() {
        let f = fixture();
        f.pipeline.hang_attaches(Duration::from_secs(30));
        let stop = CancellationToken::new();

        let err = f
            .orchestrator
            .reconnect(&key(EndpointRole::Destination), &stop)
            .await
            .unwrap_err();
        assert!(matches!(err, WatchdogError::ReconnectFailed { .. }));
        assert!(err.to_string().contains("attach timed out"));
        assert!(f.pipeline.children_of(&f.relay).is_empty());

        f.pipeline.clear_faults();
        f.orchestrator
            .reconnect(&key(EndpointRole::Destination), &stop)
            .await
            .unwrap();

        let children = f.pipeline.children_of(&f.relay);
        assert_eq!(children.len(), 1);
        assert!(f.pipeline.is_started(&children[0]));
        assert_eq!(f.pipeline.count_role("cam-1", StageRole::Destination), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_attach_rolls_back() {
        let f = fixture();
        f.pipeline.hang_attaches(Duration::from_secs(30));
        let stop = CancellationToken::new();
        // The drain ends at 3s, so the attach is in flight at 4s.
        cancel_after(&stop, Duration::from_secs(4));

        let started = Instant::now();
        let err = f
            .orchestrator
            .reconnect(&key(EndpointRole::Destination), &stop)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WatchdogError::AbortedByShutdown {
                step: "destination attach",
                ..
            }
        ));
        assert!(started.elapsed() < Duration::from_millis(4500));
        assert!(f.pipeline.children_of(&f.relay).is_empty());
        assert!(matches!(
            f.pipeline.operations().last(),
            Some(StageOp::Detach(stage)) if stage.name().starts_with("cam-1-destination-")
        ));
        assert!(f.mutation_lock.try_lock().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_construct_times_out() {
        let f = fixture();
        f.pipeline.hang_constructs(Duration::from_secs(3600));

        let started = Instant::now();
        let err = f
            .orchestrator
            .reconnect(&key(EndpointRole::Destination), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("construct timed out"));
        // Drain plus one stage operation timeout.
        assert!(started.elapsed() < Duration::from_secs(9));
        assert!(f.mutation_lock.try_lock().is_ok());
        assert!(
            !f.pipeline
                .operations()
                .iter()
                .any(|op| matches!(op, StageOp::Attach { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_construct_releases_lock() {
        let f = fixture();
        f.pipeline.hang_constructs(Duration::from_secs(3600));
        let stop = CancellationToken::new();
        cancel_after(&stop, Duration::from_secs(4));

        let started = Instant::now();
        let err = f
            .orchestrator
            .reconnect(&key(EndpointRole::Destination), &stop)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WatchdogError::AbortedByShutdown {
                step: "destination construct",
                ..
            }
        ));
        assert!(started.elapsed() < Duration::from_millis(4500));
        assert!(f.mutation_lock.try_lock().is_ok());
    }
}
