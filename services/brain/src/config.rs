//! Configuration for the brain.

use std::time::Duration;

use anyhow::{Context, Result};
use bravebird_bus::{BusConfig, RedisConfig};

/// Brain configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Broker connection.
    pub redis: RedisConfig,

    /// Consumer group shared by the brain's subscriptions.
    pub bus_group: String,

    /// Consumer name of this process within the group.
    pub bus_consumer: String,

    /// Per-channel stream cap.
    pub bus_maxlen: usize,

    /// Path of the shared-memory video region.
    pub shm_file_path: String,

    /// Largest frame accepted from the host.
    pub screen_width: u32,
    pub screen_height: u32,

    /// Whether inference collaborators should run on the accelerator.
    pub use_cuda: bool,

    /// Grounding service.
    pub ui_ins_url: String,

    /// Element detection service.
    pub omniparser_url: String,

    /// Speech-to-text service.
    pub stt_url: String,

    /// Linux micro-VM manager.
    pub arrakis_url: String,

    /// Image the micro-VM sandbox boots from.
    pub arrakis_default_image: String,

    /// Containerized Windows desktop agent.
    pub omnibox_host: String,
    pub omnibox_port: u16,

    /// Command receiver on the physical Windows host.
    pub windows_bridge_url: String,

    /// Timeout applied to every sandbox HTTP call.
    pub sandbox_timeout_secs: u64,

    /// Target used when an action request leaves `target_os` empty.
    pub default_target_os: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let log_level = env_or("BB_LOG_LEVEL", "info");

        let redis = RedisConfig {
            host: env_or("BB_REDIS_HOST", "localhost"),
            port: env_parse("BB_REDIS_PORT", 6379)?,
            db: env_parse("BB_REDIS_DB", 0)?,
            password: std::env::var("BB_REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
        };

        let use_cuda = env_or("BB_USE_CUDA", "true");
        let use_cuda = matches!(use_cuda.to_ascii_lowercase().as_str(), "1" | "true" | "yes");

        Ok(Self {
            log_level,
            redis,
            bus_group: env_or("BB_BUS_GROUP", "brain_workers"),
            bus_consumer: env_or("BB_BUS_CONSUMER", "worker_1"),
            bus_maxlen: env_parse("BB_BUS_MAXLEN", 2000)?,
            shm_file_path: env_or("BB_SHM_FILE_PATH", "/mnt/c/temp/bravebird_video.shm"),
            screen_width: env_parse("BB_SCREEN_WIDTH", 3840)?,
            screen_height: env_parse("BB_SCREEN_HEIGHT", 2160)?,
            use_cuda,
            ui_ins_url: env_or("BB_UI_INS_URL", "http://localhost:8001"),
            omniparser_url: env_or("BB_OMNIPARSER_URL", "http://localhost:8002"),
            stt_url: env_or("BB_STT_URL", "http://localhost:8003"),
            arrakis_url: env_or("BB_ARRAKIS_URL", "http://localhost:7000"),
            arrakis_default_image: env_or("BB_ARRAKIS_DEFAULT_IMAGE", "agent-sandbox"),
            omnibox_host: env_or("BB_OMNIBOX_HOST", "localhost"),
            omnibox_port: env_parse("BB_OMNIBOX_PORT", 5000)?,
            windows_bridge_url: env_or("BB_WINDOWS_BRIDGE_URL", "http://host.docker.internal:5050"),
            sandbox_timeout_secs: env_parse("BB_SANDBOX_TIMEOUT_SECS", 30)?,
            default_target_os: env_or("BB_DEFAULT_TARGET_OS", "linux"),
        })
    }

    /// Bus settings derived from this configuration.
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            group: self.bus_group.clone(),
            consumer: self.bus_consumer.clone(),
            maxlen: self.bus_maxlen,
            ..BusConfig::default()
        }
    }

    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_timeout_secs)
    }

    pub fn omnibox_url(&self) -> String {
        format!("http://{}:{}", self.omnibox_host, self.omnibox_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            redis: RedisConfig::default(),
            bus_group: "brain_workers".to_string(),
            bus_consumer: "worker_1".to_string(),
            bus_maxlen: 2000,
            shm_file_path: "/mnt/c/temp/bravebird_video.shm".to_string(),
            screen_width: 3840,
            screen_height: 2160,
            use_cuda: true,
            ui_ins_url: "http://localhost:8001".to_string(),
            omniparser_url: "http://localhost:8002".to_string(),
            stt_url: "http://localhost:8003".to_string(),
            arrakis_url: "http://localhost:7000".to_string(),
            arrakis_default_image: "agent-sandbox".to_string(),
            omnibox_host: "localhost".to_string(),
            omnibox_port: 5000,
            windows_bridge_url: "http://host.docker.internal:5050".to_string(),
            sandbox_timeout_secs: 30,
            default_target_os: "linux".to_string(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}
