//! Configuration Types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use crate::protocol::constants::DEFAULT_READ_BUFFER_SIZE;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub liveness: LivenessConfig,
    pub devices: DevicesConfig,
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Bytes requested per socket read
    pub read_buffer_size: usize,
    /// Pause after a failed accept before retrying
    #[serde(with = "humantime_serde")]
    pub accept_backoff: Duration,
}

/// Idle-connection eviction
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LivenessConfig {
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

/// Device identity configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Peer IP -> device id, applied when a connection is accepted
    pub address_mapping: HashMap<String, String>,
    /// Extra or overriding tag -> canonical id entries
    pub tag_mapping: HashMap<String, String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// List registered handlers whenever a message has no handler
    pub verbose_dispatch: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            accept_backoff: Duration::from_secs(1),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            verbose_dispatch: false,
        }
    }
}
