//! Bravebird Brain
//!
//! Connects to the event bus, starts the actors and runs until interrupted
//! or until the bus session is lost.

use std::sync::Arc;

use anyhow::{Context, Result};
use bravebird_brain::config::Config;
use bravebird_brain::BrainContext;
use bravebird_bus::{Bus, RedisBroker};
use tracing::{error, info};
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
        default_target = %config.default_target_os,
        use_cuda = config.use_cuda,
        "Starting bravebird brain"
    );

    // A bus that cannot connect is fatal.
    let broker = RedisBroker::connect(&config.redis)
        .await
        .context("failed to connect to redis")?;
    let bus = Bus::connect(Arc::new(broker), config.bus_config())
        .await
        .context("failed to establish bus session")?;

    let ctx = BrainContext::new(config, bus.clone())?;
    let mut actors = ctx.actor_system()?;
    actors.start_all().await.context("failed to start actors")?;
    info!(actors = actors.len(), "Brain online");

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
        _ = terminate() => {
            info!("Received SIGTERM");
            Ok(())
        }
        reason = bus.closed() => {
            error!(error = %reason, "Event bus closed");
            Err(anyhow::Error::new(reason))
        }
    };

    actors.stop_all().await;
    bus.disconnect().await;
    info!("Brain shutdown complete");
    outcome
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
