//! DeviceLink - TCP connection broker for warehouse hardware controllers

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

use devicelink::{
    config::ConfigManager,
    protocol::{MSG_COMMAND, MSG_ERROR, MSG_EVENT, MSG_RESPONSE},
    ConnectionManager, ShutdownCoordinator,
};

/// CLI arguments for DeviceLink
#[derive(Parser, Debug)]
#[command(name = "devicelink")]
#[command(about = "DeviceLink - TCP connection broker for hardware controllers")]
#[command(version)]
#[command(long_about = "
DeviceLink - TCP connection broker for hardware controllers

Accepts TCP connections from the sorter, environment and access controllers,
frames newline-delimited messages and routes them by device and message kind.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  DEVICELINK_BIND_ADDR       - Bind address (e.g., 0.0.0.0:9000)
  DEVICELINK_IDLE_TIMEOUT    - Idle timeout before eviction (e.g., 10m)
  DEVICELINK_CHECK_INTERVAL  - Liveness check interval (e.g., 60s)
  DEVICELINK_LOG_LEVEL       - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "Bind address (e.g., 0.0.0.0:9000)")]
    pub bind: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    /// Idle timeout in seconds
    #[arg(long, help = "Seconds of inactivity before a connection is evicted")]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let filter_handle = init_tracing(&args)?;

    info!("Starting DeviceLink v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    if args.log_level.is_none() && !args.verbose && std::env::var("RUST_LOG").is_err() {
        filter_handle
            .reload(EnvFilter::new(&config.logging.level))
            .context("Failed to apply configured log level")?;
    }

    config.merge_with_cli_args(args.bind.as_deref(), args.port, args.idle_timeout, args.verbose);
    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Bind address: {}", config.server.bind_addr);
        info!("  Idle timeout: {:?}", config.liveness.idle_timeout);
        info!("  Check interval: {:?}", config.liveness.check_interval);
        info!("  Pre-registered addresses: {}", config.devices.address_mapping.len());
        return Ok(());
    }

    let manager = ConnectionManager::new(Arc::new(config));
    register_logging_handlers(&manager);

    manager.start().await?;

    let shutdown = ShutdownCoordinator::new();
    if let Err(e) = shutdown.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    info!("Shutting down");
    manager.stop().await;
    info!("Shutdown complete");

    Ok(())
}

/// Log every standard message from each known controller
fn register_logging_handlers(manager: &ConnectionManager) {
    for (_, device_id) in manager.registry().mappings() {
        for kind in [MSG_EVENT, MSG_COMMAND, MSG_RESPONSE, MSG_ERROR] {
            let device = device_id.clone();
            manager.register_device_handler(&device_id, &kind.to_string(), move |message| {
                info!(
                    device = %device,
                    tag = %message.device_tag,
                    kind = %message.kind,
                    "{}",
                    message.content
                );
                Ok(())
            });
        }
    }
}

/// Initialize tracing/logging.
///
/// The level comes from `RUST_LOG`, then the CLI, then `DEVICELINK_LOG_LEVEL`.
/// The returned handle lets the configured level take over once the config
/// file is loaded.
fn init_tracing(args: &CliArgs) -> Result<reload::Handle<EnvFilter, Registry>> {
    let log_level = if args.verbose {
        "debug".to_string()
    } else if let Some(level) = &args.log_level {
        level.clone()
    } else {
        std::env::var("DEVICELINK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&log_level));
    let (filter_layer, filter_handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(filter_handle)
}
