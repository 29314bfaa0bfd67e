//! Liveness Sweeper
//!
//! Periodically evicts connections that have been silent for longer than the
//! idle timeout.

use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::ConnectionManager;
use crate::config::LivenessConfig;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Idle-connection eviction loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessSweeper {
    check_interval: Duration,
    idle_timeout: Duration,
}

impl Default for LivenessSweeper {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_INTERVAL, DEFAULT_IDLE_TIMEOUT)
    }
}

impl LivenessSweeper {
    pub fn new(check_interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            check_interval,
            idle_timeout,
        }
    }

    pub fn from_config(config: &LivenessConfig) -> Self {
        Self::new(config.check_interval, config.idle_timeout)
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Sweep every `check_interval` until a shutdown signal arrives
    pub async fn run(self, manager: ConnectionManager, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Started liveness sweeper (interval: {:?}, idle timeout: {:?})",
            self.check_interval, self.idle_timeout
        );
        let mut interval = tokio::time::interval(self.check_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep(&manager).await;
                }
                _ = shutdown_rx.recv() => {
                    debug!("Liveness sweeper received shutdown signal");
                    break;
                }
            }
        }
    }

    /// Run one cycle, returning the number of evicted connections
    pub async fn sweep(&self, manager: &ConnectionManager) -> usize {
        let idle = manager.idle_connections(self.idle_timeout);
        if idle.is_empty() {
            debug!("Liveness check: no idle connections");
            return 0;
        }

        let mut evicted = 0;
        for connection_id in idle {
            info!("Evicting inactive client: {}", connection_id);
            if manager.evict(&connection_id).await {
                evicted += 1;
            }
        }
        evicted
    }
}
