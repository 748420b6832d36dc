//! Bravebird capture host
//!
//! Writes screen frames into the shared-memory region, announces them on
//! the bus and serves the command receiver until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use bravebird_bus::{Bus, RedisBroker};
use bravebird_host::bridge::{self, BridgeState};
use bravebird_host::capture::{CaptureLoop, FrameCache, TestPattern};
use bravebird_host::config::Config;
use bravebird_host::controller::DryRunController;
use bravebird_shm::ShmWriter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        redis_host = %config.redis.host,
        redis_port = config.redis.port,
        shm = %config.shm_file_path,
        fps = config.capture_fps,
        width = config.screen_width,
        height = config.screen_height,
        "Starting bravebird host"
    );

    let broker = RedisBroker::connect(&config.redis)
        .await
        .context("failed to connect to redis")?;
    let bus = Bus::connect(Arc::new(broker), config.bus_config())
        .await
        .context("failed to establish bus session")?;

    let writer = ShmWriter::create(&config.shm_file_path, config.screen_width, config.screen_height)
        .with_context(|| format!("failed to create video region {}", config.shm_file_path))?;

    let cancel = CancellationToken::new();
    let frames = FrameCache::new();

    warn!("no platform input backend compiled in, actions are recorded only");
    let state = BridgeState {
        controller: Arc::new(DryRunController::new(config.screen_width, config.screen_height)),
        frames: frames.clone(),
    };
    let bridge = bridge::spawn(config.bridge_addr()?, state, cancel.clone())
        .context("failed to start command receiver thread")?;

    let capture = CaptureLoop::new(
        TestPattern::new(config.screen_width, config.screen_height),
        writer,
        bus.clone(),
        tokio::runtime::Handle::current(),
        frames,
        config.frame_interval(),
        cancel.clone(),
    )
    .spawn()
    .context("failed to start capture thread")?;

    info!("Host online");

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
        reason = bus.closed() => {
            error!(error = %reason, "Event bus closed");
            Err(anyhow::Error::new(reason))
        }
    };

    cancel.cancel();
    let (capture, bridge) =
        tokio::task::spawn_blocking(move || (capture.join(), bridge.join())).await?;
    match capture {
        Ok(stats) => info!(frames = stats.frames, errors = stats.errors, "capture stopped"),
        Err(_) => error!("capture thread panicked"),
    }
    match bridge {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "command receiver exited with error"),
        Err(_) => error!("command receiver thread panicked"),
    }

    bus.disconnect().await;
    info!("Host shutdown complete");
    outcome
}
