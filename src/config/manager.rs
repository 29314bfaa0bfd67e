//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{Context, bail};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config.validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(bind_addr) = std::env::var("DEVICELINK_BIND_ADDR") {
            config.server.bind_addr = bind_addr.parse::<SocketAddr>()
                .with_context(|| format!("Invalid DEVICELINK_BIND_ADDR: {}", bind_addr))?;
        }

        if let Ok(timeout) = std::env::var("DEVICELINK_IDLE_TIMEOUT") {
            config.liveness.idle_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid DEVICELINK_IDLE_TIMEOUT: {}", timeout))?;
        }

        if let Ok(interval) = std::env::var("DEVICELINK_CHECK_INTERVAL") {
            config.liveness.check_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid DEVICELINK_CHECK_INTERVAL: {}", interval))?;
        }

        if let Ok(log_level) = std::env::var("DEVICELINK_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_liveness_config()
            .with_context(|| "Liveness configuration validation failed")?;

        self.validate_devices_config()
            .with_context(|| "Device configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.read_buffer_size == 0 {
            bail!("read_buffer_size must be greater than 0");
        }

        if self.server.read_buffer_size > 1048576 {
            bail!("read_buffer_size cannot exceed 1MB");
        }

        if self.server.accept_backoff.is_zero() {
            bail!("accept_backoff must be greater than 0");
        }

        Ok(())
    }

    fn validate_liveness_config(&self) -> Result<()> {
        if self.liveness.check_interval.is_zero() {
            bail!("check_interval must be greater than 0");
        }

        if self.liveness.idle_timeout.is_zero() {
            bail!("idle_timeout must be greater than 0");
        }

        if self.liveness.check_interval > self.liveness.idle_timeout {
            bail!("check_interval cannot exceed idle_timeout");
        }

        Ok(())
    }

    fn validate_devices_config(&self) -> Result<()> {
        for (ip, device_id) in &self.devices.address_mapping {
            ip.parse::<IpAddr>()
                .with_context(|| format!("address_mapping key {:?} is not an IP address", ip))?;

            if device_id.is_empty() {
                bail!("address_mapping entry {} has an empty device id", ip);
            }
        }

        for (tag, device_id) in &self.devices.tag_mapping {
            if tag.chars().count() != 1 {
                bail!("tag_mapping key {:?} must be exactly one character", tag);
            }

            if device_id.is_empty() {
                bail!("tag_mapping entry {} has an empty device id", tag);
            }
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<&str>,
        port: Option<u16>,
        idle_timeout: Option<u64>,
        verbose_dispatch: bool,
    ) {
        if let Some(bind_str) = bind {
            if let Ok(addr) = bind_str.parse::<SocketAddr>() {
                self.server.bind_addr = addr;
                tracing::info!("CLI override: bind address set to {}", addr);
            } else {
                tracing::warn!("Invalid bind address provided: {}", bind_str);
            }
        }

        if let Some(port) = port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(timeout_secs) = idle_timeout {
            self.liveness.idle_timeout = Duration::from_secs(timeout_secs);
            tracing::info!("CLI override: idle timeout set to {}s", timeout_secs);
        }

        if verbose_dispatch {
            self.logging.verbose_dispatch = true;
            tracing::info!("CLI override: verbose dispatch enabled");
        }
    }
}
