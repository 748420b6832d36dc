//! Configuration for the capture host.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use bravebird_bus::{BusConfig, RedisConfig};

/// Host configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Broker the brain listens on.
    pub redis: RedisConfig,

    /// Path of the shared-memory video region.
    pub shm_file_path: String,

    /// Frames captured per second.
    pub capture_fps: u32,

    /// Size of the captured screen. Also the region's capacity.
    pub screen_width: u32,
    pub screen_height: u32,

    /// Address the command receiver binds to.
    pub host_ip: String,
    pub bridge_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            log_level: env_or("BB_WIN_LOG_LEVEL", "info"),
            redis: RedisConfig {
                host: env_or("BB_WIN_REDIS_HOST", "localhost"),
                port: env_parse("BB_WIN_REDIS_PORT", 6379)?,
                db: env_parse("BB_WIN_REDIS_DB", 0)?,
                password: None,
            },
            shm_file_path: env_or("BB_WIN_SHM_FILE_PATH", r"C:\temp\bravebird_video.shm"),
            capture_fps: env_parse("BB_WIN_CAPTURE_FPS", 5)?,
            screen_width: env_parse("BB_WIN_SCREEN_WIDTH", 1920)?,
            screen_height: env_parse("BB_WIN_SCREEN_HEIGHT", 1080)?,
            host_ip: env_or("BB_WIN_HOST_IP", "0.0.0.0"),
            bridge_port: env_parse("BB_WIN_BRIDGE_PORT", 5050)?,
        })
    }

    /// Time budget of one capture iteration.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.capture_fps.max(1) as f64)
    }

    pub fn bridge_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host_ip, self.bridge_port)
            .parse()
            .with_context(|| format!("invalid bridge address {}:{}", self.host_ip, self.bridge_port))
    }

    /// The host only publishes; its group is never read.
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            group: "windows_host".to_string(),
            consumer: "capture".to_string(),
            ..BusConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            redis: RedisConfig::default(),
            shm_file_path: r"C:\temp\bravebird_video.shm".to_string(),
            capture_fps: 5,
            screen_width: 1920,
            screen_height: 1080,
            host_ip: "0.0.0.0".to_string(),
            bridge_port: 5050,
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
