// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that removes expired `terminating` records.
//!
//! Terminated instances stay in the registry as tombstones for a grace window
//! so concurrent readers see `terminating` rather than a missing record.
//! Termination is re-issued before a tombstone is deleted, so a record whose
//! provider call failed stays until the provider accepts it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use loopfleet_core::{InstanceFilter, InstanceStatus};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::lifecycle::InstanceLauncher;

/// Configuration for the tombstone sweeper.
#[derive(Debug, Clone)]
pub struct TombstoneSweeperConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// How long a tombstone is kept.
    pub grace: Duration,
}

impl Default for TombstoneSweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            grace: Duration::from_secs(60),
        }
    }
}

/// Background worker that deletes tombstones older than the grace window.
pub struct TombstoneSweeper {
    launcher: InstanceLauncher,
    config: TombstoneSweeperConfig,
    shutdown: Arc<Notify>,
}

impl TombstoneSweeper {
    /// Create a new sweeper.
    pub fn new(launcher: InstanceLauncher, config: TombstoneSweeperConfig) -> Self {
        Self {
            launcher,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            grace_secs = self.config.grace.as_secs(),
            "Tombstone sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Tombstone sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Failed to sweep tombstones");
                    }
                }
            }
        }

        info!("Tombstone sweeper stopped");
    }

    /// Delete tombstones older than the grace window. Returns removed ids.
    ///
    /// A tombstone whose termination the provider still refuses is kept and
    /// retried on the next sweep.
    pub async fn sweep_once(&self) -> Result<Vec<String>> {
        let Some(cutoff) = chrono::Duration::from_std(self.config.grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
        else {
            return Ok(Vec::new());
        };

        let registry = self.launcher.registry();
        let tombstones = registry
            .list_instances(&InstanceFilter::with_statuses(&[InstanceStatus::Terminating]))
            .await?;

        let mut removed = Vec::new();
        for record in tombstones {
            if !record.terminating_since.is_some_and(|since| since < cutoff) {
                continue;
            }
            if let Err(e) = self.launcher.issue_termination(&record.instance_id).await {
                warn!(
                    instance_id = %record.instance_id,
                    error = %e,
                    "Termination still failing, keeping tombstone"
                );
                continue;
            }
            if registry.delete_instance(&record.instance_id).await? {
                removed.push(record.instance_id);
            }
        }

        if removed.is_empty() {
            debug!("No expired tombstones");
        } else {
            info!(count = removed.len(), instance_ids = ?removed, "Swept tombstones");
        }
        Ok(removed)
    }
}
