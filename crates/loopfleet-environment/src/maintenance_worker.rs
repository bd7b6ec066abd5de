// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that keeps the warm pool at its target size.
//!
//! Each tick runs [`WarmPool::maintain`]: the deficit is provisioned and warm
//! instances past their maximum age are rotated. Errors are logged and the
//! next tick tries again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::warm_pool::WarmPool;

/// Configuration for the maintenance worker.
#[derive(Debug, Clone)]
pub struct MaintenanceWorkerConfig {
    /// How often to run maintenance.
    pub poll_interval: Duration,
    /// Run one pass immediately instead of waiting for the first tick.
    pub run_on_start: bool,
}

impl Default for MaintenanceWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(900), // 15 minutes
            run_on_start: true,
        }
    }
}

/// Background worker that periodically maintains the warm pool.
pub struct MaintenanceWorker {
    pool: WarmPool,
    config: MaintenanceWorkerConfig,
    shutdown: Arc<Notify>,
}

impl MaintenanceWorker {
    /// Create a new maintenance worker.
    pub fn new(pool: WarmPool, config: MaintenanceWorkerConfig) -> Self {
        Self {
            pool,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the maintenance loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            pool_size = self.pool.config().pool_size,
            "Maintenance worker started"
        );

        if self.config.run_on_start {
            self.tick().await;
        }

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Maintenance worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.tick().await;
                }
            }
        }

        info!("Maintenance worker stopped");
    }

    async fn tick(&self) {
        match self.pool.maintain().await {
            Ok(report) if report.provisioned.is_empty() && report.failures == 0 => {
                debug!("Warm pool at target")
            }
            Ok(report) => info!(
                provisioned = report.provisioned.len(),
                rotated = report.rotated.len(),
                failures = report.failures,
                "Warm pool maintained"
            ),
            Err(e) => error!(error = %e, "Warm pool maintenance failed"),
        }
    }
}
