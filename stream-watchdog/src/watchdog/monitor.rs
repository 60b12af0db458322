//! The per-endpoint polling loop.
//!
//! One [`WatchdogLoop`] runs per supervised (instance, role) pair. Each poll
//! it snapshots its record, asks the policy for an [`Assessment`] and, when
//! the endpoint is silent, drives the configured [`Reconnector`] while
//! honouring the attempt limit and cooldown. Errors never escape the loop;
//! they are logged and counted.

use std::sync::Arc;
use std::time::Duration;

use pipeline_graph::{EndpointRole, InstanceState};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::adapter::Reconnector;
use super::error::WatchdogError;
use super::metrics::WatchdogMetrics;
use super::policy::{Assessment, assess};
use super::record::{RecordSnapshot, WatchdogKey, WatchdogPhase, WatchdogRecord, WatchdogStore};
use crate::config::WatchdogConfig;

/// First progress log while waiting for an initial connection.
const FIRST_PROGRESS_LOG: Duration = Duration::from_secs(10);

/// Progress log interval once the fixed milestones have passed.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Everything a loop shares with the controller that spawned it.
#[derive(Clone)]
pub(crate) struct WatchdogContext {
    pub store: WatchdogStore,
    pub config: Arc<WatchdogConfig>,
    pub reconnector: Arc<dyn Reconnector>,
    pub instances: Arc<dyn InstanceState>,
    pub metrics: Arc<WatchdogMetrics>,
}

/// Why a loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    Stopped,
    InstanceGone,
    RecordReplaced,
}

pub(crate) struct WatchdogLoop {
    ctx: WatchdogContext,
    key: WatchdogKey,
    generation: u64,
    stop: CancellationToken,
    next_progress_log: Duration,
    exhausted_logged: bool,
}

impl WatchdogLoop {
    pub fn new(ctx: WatchdogContext, record: &WatchdogRecord) -> Self {
        Self {
            ctx,
            key: record.key.clone(),
            generation: record.generation,
            stop: record.stop.clone(),
            next_progress_log: FIRST_PROGRESS_LOG,
            exhausted_logged: false,
        }
    }

    /// Run until stopped, the instance stops running, or the record is gone.
    pub async fn run(mut self) -> LoopExit {
        info!(
            generation = self.generation,
            poll_interval_ms = self.ctx.config.poll_interval.as_millis() as u64,
            "Watchdog started"
        );

        let exit = loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break LoopExit::Stopped,
                _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
            }

            if !self.ctx.instances.is_running(&self.key.instance_id).await {
                break LoopExit::InstanceGone;
            }
            if self.stop.is_cancelled() {
                break LoopExit::Stopped;
            }

            let Some(snapshot) = self.current_snapshot() else {
                break LoopExit::RecordReplaced;
            };
            self.poll(snapshot).await;
        };

        self.ctx
            .store
            .update_generation(&self.key, self.generation, |record| {
                record.phase = WatchdogPhase::Stopped;
            });
        if exit == LoopExit::InstanceGone {
            // Nobody will call stop for us; drop our own record.
            self.ctx
                .store
                .remove_if_generation(&self.key, self.generation);
            self.ctx.metrics.record_stopped(&self.key, false);
        }
        info!(?exit, "Watchdog exited");
        exit
    }

    fn current_snapshot(&self) -> Option<RecordSnapshot> {
        self.ctx
            .store
            .snapshot(&self.key)
            .filter(|snapshot| snapshot.generation == self.generation)
    }

    async fn poll(&mut self, snapshot: RecordSnapshot) {
        let now = Instant::now();
        let source = match self.key.role {
            EndpointRole::Destination => self.ctx.store.snapshot(&self.key.peer()),
            EndpointRole::Source => None,
        };

        match assess(&self.ctx.config, &snapshot, source.as_ref(), now) {
            Assessment::InitialConnecting { waited } => self.log_progress(waited),
            Assessment::Healthy => self.on_healthy(&snapshot, now),
            Assessment::GracePeriod { remaining } => {
                debug!(
                    silent_ms = snapshot.silent_for(now).as_millis() as u64,
                    grace_remaining_ms = remaining.as_millis() as u64,
                    "Silent inside reconnect grace period"
                );
            }
            Assessment::Deferred => {
                debug!("Source is stalled, deferring destination reconnect");
            }
            Assessment::Disconnected { silent_for, early } => {
                self.on_disconnected(&snapshot, silent_for, early, now)
                    .await;
            }
        }
    }

    fn log_progress(&mut self, waited: Duration) {
        if waited < self.next_progress_log {
            return;
        }
        let timeout = self.ctx.config.timeouts(self.key.role).initial_connection;
        info!(
            waited_secs = waited.as_secs(),
            timeout_secs = timeout.as_secs(),
            "Still waiting for initial connection"
        );
        self.next_progress_log = match self.next_progress_log.as_secs() {
            10 => Duration::from_secs(30),
            30 => Duration::from_secs(60),
            _ => self.next_progress_log + PROGRESS_LOG_INTERVAL,
        };
    }

    fn on_healthy(&mut self, snapshot: &RecordSnapshot, now: Instant) {
        if snapshot.last_activity.is_none() {
            return;
        }
        self.exhausted_logged = false;

        if snapshot.phase == WatchdogPhase::InitialConnecting {
            info!(
                connect_ms = snapshot.since_start(now).as_millis() as u64,
                "Endpoint connected"
            );
            self.ctx.metrics.record_connected(&self.key);
        }
        if snapshot.reconnect_attempts > 0 {
            info!(
                attempts = snapshot.reconnect_attempts,
                "Stream active again, clearing reconnect attempts"
            );
        }
        if snapshot.phase != WatchdogPhase::Connected || snapshot.reconnect_attempts > 0 {
            self.ctx
                .store
                .update_generation(&self.key, self.generation, |record| {
                    record.has_connected = true;
                    record.reconnect_attempts = 0;
                    record.phase = WatchdogPhase::Connected;
                });
        }
    }

    async fn on_disconnected(
        &mut self,
        snapshot: &RecordSnapshot,
        silent_for: Duration,
        early: bool,
        now: Instant,
    ) {
        let max_attempts = self.ctx.config.max_reconnect_attempts;
        let attempts = snapshot.reconnect_attempts;

        if attempts >= max_attempts {
            self.set_phase(WatchdogPhase::Exhausted);
            if !self.exhausted_logged {
                self.exhausted_logged = true;
                let err = WatchdogError::max_attempts(&self.key, attempts);
                error!(error = %err, "Endpoint stays down until reset or restart");
                self.ctx.metrics.record_exhausted(&self.key, attempts);
            }
            return;
        }
        self.exhausted_logged = false;

        let cooldown = self.ctx.config.reconnect_cooldown;
        let since_attempt = snapshot
            .last_reconnect_attempt
            .map(|at| now.saturating_duration_since(at));
        let cooldown_elapsed = since_attempt.is_none_or(|elapsed| elapsed >= cooldown);

        if !cooldown_elapsed && !early {
            self.set_phase(WatchdogPhase::SuspectedDisconnected);
            debug!(
                remaining_ms = since_attempt
                    .map(|elapsed| cooldown.saturating_sub(elapsed).as_millis() as u64)
                    .unwrap_or(0),
                "Reconnect cooldown active"
            );
            return;
        }

        let lost = WatchdogError::connection_lost(&self.key, silent_for);
        warn!(
            error = %lost,
            early,
            attempt = attempts + 1,
            max_attempts,
            "Reconnecting"
        );
        self.reconnect().await;
    }

    async fn reconnect(&mut self) {
        self.set_phase(WatchdogPhase::Reconnecting);
        self.ctx.metrics.record_reconnect_attempt();

        let result = self.ctx.reconnector.reconnect(&self.key, &self.stop).await;
        let now = Instant::now();

        match result {
            Ok(()) => {
                self.ctx
                    .store
                    .update_generation(&self.key, self.generation, |record| {
                        record.reconnect_attempts = 0;
                        record.last_reconnect_attempt = Some(now);
                        record.last_successful_reconnect = Some(now);
                        record.touch(now);
                        record.phase = WatchdogPhase::Connected;
                    });
                self.ctx.metrics.record_reconnect_success(&self.key);
                info!("Reconnect succeeded");
            }
            Err(err) => {
                let attempts = self
                    .ctx
                    .store
                    .update_generation(&self.key, self.generation, |record| {
                        record.reconnect_attempts = record.reconnect_attempts.saturating_add(1);
                        record.last_reconnect_attempt = Some(now);
                        record.phase = WatchdogPhase::SuspectedDisconnected;
                        record.reconnect_attempts
                    })
                    .unwrap_or_default();
                self.ctx
                    .metrics
                    .record_reconnect_failure(&self.key, attempts, err.is_abort());
                if err.is_abort() {
                    info!(error = %err, "Reconnect interrupted");
                } else {
                    warn!(error = %err, attempts, "Reconnect failed");
                }
            }
        }
    }

    fn set_phase(&self, phase: WatchdogPhase) {
        self.ctx
            .store
            .update_generation(&self.key, self.generation, |record| record.phase = phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pipeline_graph::MemoryPipeline;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reconnector that fails a fixed number of times, then succeeds.
    struct FlakyReconnector {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyReconnector {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Reconnector for FlakyReconnector {
        async fn reconnect(
            &self,
            key: &WatchdogKey,
            _stop: &CancellationToken,
        ) -> Result<(), WatchdogError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(WatchdogError::reconnect_failed(key, "scripted failure"))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        store: WatchdogStore,
        pipeline: Arc<MemoryPipeline>,
        key: WatchdogKey,
        record_stop: CancellationToken,
        handle: tokio::task::JoinHandle<LoopExit>,
    }

    fn spawn(
        role: EndpointRole,
        config: WatchdogConfig,
        reconnector: Arc<dyn Reconnector>,
    ) -> Harness {
        crate::test_utils::init_tracing();
        let store = WatchdogStore::new();
        let pipeline = Arc::new(MemoryPipeline::new());
        pipeline.add_instance("cam-1");

        let key = WatchdogKey::new("cam-1", role);
        let record = WatchdogRecord::new(key.clone(), store.next_generation(), Instant::now());
        let ctx = WatchdogContext {
            store: store.clone(),
            config: Arc::new(config),
            reconnector,
            instances: pipeline.clone(),
            metrics: Arc::new(WatchdogMetrics::new()),
        };
        let watchdog = WatchdogLoop::new(ctx, &record);
        let record_stop = record.stop.clone();
        store.insert(record);

        Harness {
            store,
            pipeline,
            key,
            record_stop,
            handle: tokio::spawn(watchdog.run()),
        }
    }

    fn fast_config() -> WatchdogConfig {
        let mut config = WatchdogConfig::default();
        config.max_reconnect_attempts = 3;
        config.reconnect_cooldown = Duration::ZERO;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_then_resumes_after_reset() {
        let reconnector = FlakyReconnector::new(u32::MAX);
        let h = spawn(EndpointRole::Source, fast_config(), reconnector.clone());

        // Attempts at 60s, 62s and 64s, then nothing.
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(reconnector.calls(), 3);
        let snapshot = h.store.snapshot(&h.key).unwrap();
        assert_eq!(snapshot.phase, WatchdogPhase::Exhausted);
        assert_eq!(snapshot.reconnect_attempts, 3);

        h.store.update(&h.key, |record| record.reconnect_attempts = 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(reconnector.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_activity_clears_attempts() {
        let reconnector = FlakyReconnector::new(u32::MAX);
        let h = spawn(EndpointRole::Source, fast_config(), reconnector.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(reconnector.calls(), 1);

        h.store.update(&h.key, |record| record.touch(Instant::now()));
        tokio::time::sleep(Duration::from_secs(2)).await;

        let snapshot = h.store.snapshot(&h.key).unwrap();
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert_eq!(snapshot.phase, WatchdogPhase::Connected);
        assert_eq!(reconnector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_spaces_attempts() {
        let reconnector = FlakyReconnector::new(u32::MAX);
        let mut config = WatchdogConfig::default();
        config.reconnect_cooldown = Duration::from_secs(10);
        let h = spawn(EndpointRole::Source, config, reconnector.clone());

        // First attempt at 60s, then 70s and 80s.
        tokio::time::sleep(Duration::from_secs(81)).await;
        assert_eq!(reconnector.calls(), 3);
        assert_eq!(
            h.store.snapshot(&h.key).unwrap().phase,
            WatchdogPhase::SuspectedDisconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_when_instance_stops_running() {
        let reconnector = FlakyReconnector::new(0);
        let h = spawn(EndpointRole::Destination, WatchdogConfig::default(), reconnector);

        h.pipeline.set_running("cam-1", false);
        let exit = h.handle.await.unwrap();

        assert_eq!(exit, LoopExit::InstanceGone);
        assert!(!h.store.contains(&h.key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_exits_immediately() {
        let reconnector = FlakyReconnector::new(0);
        let h = spawn(EndpointRole::Source, WatchdogConfig::default(), reconnector.clone());

        tokio::time::sleep(Duration::from_millis(500)).await;
        h.record_stop.cancel();
        let exit = h.handle.await.unwrap();

        assert_eq!(exit, LoopExit::Stopped);
        assert_eq!(
            h.store.snapshot(&h.key).unwrap().phase,
            WatchdogPhase::Stopped
        );
        assert_eq!(reconnector.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_when_record_replaced() {
        let reconnector = FlakyReconnector::new(0);
        let h = spawn(EndpointRole::Source, WatchdogConfig::default(), reconnector);

        let generation = h.store.next_generation();
        h.store
            .insert(WatchdogRecord::new(h.key.clone(), generation, Instant::now()));
        let exit = h.handle.await.unwrap();

        assert_eq!(exit, LoopExit::RecordReplaced);
        let snapshot = h.store.snapshot(&h.key).unwrap();
        assert_eq!(snapshot.phase, WatchdogPhase::InitialConnecting);
    }
}
