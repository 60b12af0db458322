//! Simulation binary.
//!
//! Runs one in-memory pipeline instance (source -> overlay -> destination)
//! under the watchdog, feeds it a simulated hot path that stalls at random,
//! and prints watchdog status as JSON until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pipeline_graph::{EndpointConfig, EndpointRole, MemoryPipeline, StageRole};
use stream_watchdog::WatchdogConfig;
use stream_watchdog::logging;
use stream_watchdog::watchdog::{ActivityTracker, LifecycleController, WatchdogEvent};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const INSTANCE_ID: &str = "demo-1";

/// Interval between simulated transfers.
const TRANSFER_INTERVAL: Duration = Duration::from_millis(200);

/// Chance per transfer that an endpoint starts stalling.
const STALL_PROBABILITY: f64 = 0.002;

/// Upper bound of a simulated stall.
const MAX_STALL: Duration = Duration::from_secs(45);

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_dir = std::env::var("WATCHDOG_LOG_DIR").ok().map(PathBuf::from);
    let (logging_config, _log_guard) = logging::init_logging(log_dir.as_deref())?;

    let config = WatchdogConfig::from_env();
    config.validate()?;

    let cancel = CancellationToken::new();
    logging_config.start_retention_cleanup(cancel.clone());

    let controller = Arc::new(LifecycleController::for_pipeline(
        config,
        Arc::new(build_pipeline()),
        Arc::new(Mutex::new(())),
    ));
    info!(
        filter = %logging_config.get_filter(),
        config = ?controller.config(),
        "Starting stream watchdog simulation"
    );

    let roles = controller.start_instance(INSTANCE_ID).await?;
    info!(instance_id = INSTANCE_ID, ?roles, "Supervising instance");

    let mut events = controller.metrics().subscribe();
    let event_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = event_cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(WatchdogEvent::Exhausted { key, attempts }) => {
                        warn!(%key, attempts, "Endpoint exhausted its reconnect attempts");
                    }
                    Ok(event) => info!(?event, "Watchdog event"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Watchdog event receiver lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    for role in EndpointRole::ALL {
        tokio::spawn(simulate_hot_path(controller.tracker(), role, cancel.clone()));
    }

    let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            _ = status_tick.tick() => {
                println!("{}", serde_json::to_string_pretty(&controller.statuses())?);
                println!("{}", serde_json::to_string(&controller.metrics().snapshot())?);
            }
        }
    }

    cancel.cancel();
    controller.shutdown().await;
    info!(metrics = ?controller.metrics().snapshot(), "Stream watchdog stopped");
    Ok(())
}

fn build_pipeline() -> MemoryPipeline {
    let pipeline = MemoryPipeline::new();
    pipeline.add_instance(INSTANCE_ID);
    pipeline.set_endpoint(
        INSTANCE_ID,
        EndpointRole::Source,
        EndpointConfig::new("rtmp://ingest.local/live/cam").with_channel(1),
    );
    pipeline.set_endpoint(
        INSTANCE_ID,
        EndpointRole::Destination,
        EndpointConfig::new("rtmp://egress.local/live/out")
            .with_channel(1)
            .with_param("bitrate", "4000k"),
    );

    let source = pipeline.add_stage(INSTANCE_ID, "demo-1-source", StageRole::Source, None);
    let overlay =
        pipeline.add_stage(INSTANCE_ID, "demo-1-overlay", StageRole::Relay, Some(&source));
    pipeline.add_stage(
        INSTANCE_ID,
        "demo-1-destination",
        StageRole::Destination,
        Some(&overlay),
    );
    pipeline
}

/// Report transfers for one endpoint, pausing now and then to provoke the
/// watchdog.
async fn simulate_hot_path(
    tracker: ActivityTracker,
    role: EndpointRole,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(TRANSFER_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if rand::random::<f64>() < STALL_PROBABILITY {
            let stall = MAX_STALL.mul_f64(rand::random::<f64>());
            info!(%role, stall_secs = stall.as_secs(), "Simulating stall");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(stall) => {}
            }
        }

        tracker.record_activity(INSTANCE_ID, role);
    }
}
