// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Warm pool of pre-provisioned instances.
//!
//! The pool keeps `pool_size` warm instances in `available` so executions can
//! start without waiting for a cold boot. Claiming a warm instance takes it
//! out of the pool for good: when it is recycled it becomes a regular
//! `available` instance, and a background backfill provisions a replacement.
//!
//! Warm provisioning counts against the same capacity ceiling as cold
//! launches. When the ceiling is reached the pool simply stays short.

use std::time::Duration;

use chrono::{DateTime, Utc};
use loopfleet_core::{InstanceFilter, InstanceRecord, InstanceStatus};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::WarmPoolConfig;
use crate::error::{Error, Result};
use crate::lifecycle::{InstanceLauncher, LaunchPurpose};
use crate::provider::ProviderError;

/// Outcome of one [`WarmPool::maintain`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Warm instances provisioned to cover the deficit.
    pub provisioned: Vec<String>,
    /// Aged instances retired after their replacement was ready.
    pub rotated: Vec<String>,
    /// Provisioning attempts that failed.
    pub failures: usize,
}

/// Outcome of one [`WarmPool::reconcile`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Records removed because the provider no longer has a live instance.
    pub removed: Vec<String>,
    /// The maintenance pass that followed.
    pub maintenance: MaintenanceReport,
}

/// Coarse pool health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    /// At or above target.
    Healthy,
    /// One short of target, with at least one instance available.
    Degraded,
    /// Further below target.
    NeedsAttention,
}

/// One warm instance in a status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmInstanceInfo {
    /// Instance id.
    pub instance_id: String,
    /// Current status.
    pub status: InstanceStatus,
    /// Age in whole seconds.
    pub age_secs: i64,
    /// Age as `"<h>h <m>m"`.
    pub age_display: String,
    /// Address, once ready.
    pub ip_address: Option<String>,
}

/// Snapshot of the warm pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmPoolStatus {
    /// Warm instances, launching or available.
    pub total: usize,
    /// Warm instances ready to hand out.
    pub available: usize,
    /// Warm instances still booting.
    pub launching: usize,
    /// Busy instances across the whole fleet.
    pub busy: usize,
    /// Configured pool size.
    pub target: usize,
    /// Per-instance detail.
    pub instances: Vec<WarmInstanceInfo>,
    /// Health derived from `available` and `target`.
    pub health: PoolHealth,
}

/// Format an age as hours and minutes.
pub fn format_age(age: Duration) -> String {
    let minutes = age.as_secs() / 60;
    format!("{}h {}m", minutes / 60, minutes % 60)
}

fn health(available: usize, target: usize) -> PoolHealth {
    if available >= target {
        PoolHealth::Healthy
    } else if available > 0 && available + 1 >= target {
        PoolHealth::Degraded
    } else {
        PoolHealth::NeedsAttention
    }
}

fn warm_filter(statuses: &[InstanceStatus]) -> InstanceFilter {
    InstanceFilter::with_statuses(statuses).warm(true)
}

/// Warm pool manager.
#[derive(Clone)]
pub struct WarmPool {
    launcher: InstanceLauncher,
    config: WarmPoolConfig,
}

impl WarmPool {
    /// Create a pool manager.
    pub fn new(launcher: InstanceLauncher, config: WarmPoolConfig) -> Self {
        Self { launcher, config }
    }

    /// Pool settings.
    pub fn config(&self) -> &WarmPoolConfig {
        &self.config
    }

    /// Bring the pool up to size and rotate aged instances.
    ///
    /// Provisioning failures are counted and logged, never returned, so one
    /// bad launch does not abort the pass. Running into the capacity ceiling
    /// ends the pass early.
    pub async fn maintain(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        let registry = self.launcher.registry();

        let available = registry
            .count_instances(&warm_filter(&[InstanceStatus::Available]))
            .await? as usize;
        let deficit = self.config.pool_size.saturating_sub(available);

        if deficit > 0 {
            info!(
                available,
                target = self.config.pool_size,
                deficit,
                "Warm pool below target"
            );
        }

        for _ in 0..deficit {
            match self.launcher.provision(LaunchPurpose::Warm).await {
                Ok(record) => report.provisioned.push(record.instance_id),
                Err(Error::PoolExhausted { active, max }) => {
                    warn!(active, max, "Capacity ceiling reached, warm pool left short");
                    report.failures += 1;
                    return Ok(report);
                }
                Err(e) => {
                    error!(error = %e, "Failed to provision warm instance");
                    report.failures += 1;
                }
            }
        }

        self.rotate(&mut report).await?;

        debug!(
            provisioned = report.provisioned.len(),
            rotated = report.rotated.len(),
            failures = report.failures,
            "Warm pool maintenance finished"
        );
        Ok(report)
    }

    /// Replace warm instances older than `max_age`.
    ///
    /// The replacement is provisioned before the old instance is retired, so
    /// rotation never shrinks the pool. If the replacement fails the old
    /// instance stays in service.
    async fn rotate(&self, report: &mut MaintenanceReport) -> Result<()> {
        let now = Utc::now();
        let aged: Vec<InstanceRecord> = self
            .launcher
            .registry()
            .list_instances(&warm_filter(&[InstanceStatus::Available]))
            .await?
            .into_iter()
            .filter(|r| self.is_aged(r, now))
            .collect();

        for record in aged {
            info!(
                instance_id = %record.instance_id,
                age = %format_age(age_of(&record, now)),
                "Rotating aged warm instance"
            );

            match self.launcher.provision(LaunchPurpose::Warm).await {
                Ok(replacement) => report.provisioned.push(replacement.instance_id),
                Err(e) => {
                    warn!(
                        instance_id = %record.instance_id,
                        error = %e,
                        "Replacement failed, keeping aged instance"
                    );
                    report.failures += 1;
                    if matches!(e, Error::PoolExhausted { .. }) {
                        return Ok(());
                    }
                    continue;
                }
            }

            match self.launcher.retire_warm(&record.instance_id).await {
                Ok(true) => report.rotated.push(record.instance_id),
                Ok(false) => {
                    debug!(instance_id = %record.instance_id, "Aged instance was claimed before retirement")
                }
                Err(e) => {
                    error!(instance_id = %record.instance_id, error = %e, "Failed to retire aged instance")
                }
            }
        }

        Ok(())
    }

    fn is_aged(&self, record: &InstanceRecord, now: DateTime<Utc>) -> bool {
        age_of(record, now) > self.config.max_age
    }

    /// Claim the least recently used warm instance for `execution_id`.
    ///
    /// On success a backfill is started in the background and not awaited.
    pub async fn get_warm_instance(&self, execution_id: &str) -> Result<Option<String>> {
        let Some(record) = self
            .launcher
            .registry()
            .claim_available_instance(true, execution_id, Utc::now())
            .await?
        else {
            debug!(execution_id = %execution_id, "No warm instance available");
            return Ok(None);
        };

        info!(
            execution_id = %execution_id,
            instance_id = %record.instance_id,
            "Warm instance claimed"
        );

        let pool = self.clone();
        tokio::spawn(async move {
            if let Err(e) = pool.backfill().await {
                error!(error = %e, "Warm pool backfill failed");
            }
        });

        Ok(Some(record.instance_id))
    }

    /// Provision one warm instance unless enough are already available or
    /// booting.
    pub async fn backfill(&self) -> Result<Option<String>> {
        let pending = self
            .launcher
            .registry()
            .count_instances(&warm_filter(&[
                InstanceStatus::Launching,
                InstanceStatus::Available,
            ]))
            .await? as usize;
        if pending >= self.config.pool_size {
            return Ok(None);
        }

        match self.launcher.provision(LaunchPurpose::Warm).await {
            Ok(record) => Ok(Some(record.instance_id)),
            Err(Error::PoolExhausted { active, max }) => {
                debug!(active, max, "Backfill skipped at capacity ceiling");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Snapshot the pool.
    pub async fn get_status(&self) -> Result<WarmPoolStatus> {
        let registry = self.launcher.registry();
        let now = Utc::now();

        let warm = registry
            .list_instances(&warm_filter(&[
                InstanceStatus::Launching,
                InstanceStatus::Available,
            ]))
            .await?;
        let busy = registry
            .count_instances(&InstanceFilter::with_statuses(&[InstanceStatus::Busy]))
            .await? as usize;

        let available = warm
            .iter()
            .filter(|r| r.status == InstanceStatus::Available)
            .count();
        let launching = warm.len() - available;

        let instances = warm
            .iter()
            .map(|r| {
                let age = age_of(r, now);
                WarmInstanceInfo {
                    instance_id: r.instance_id.clone(),
                    status: r.status,
                    age_secs: age.as_secs() as i64,
                    age_display: format_age(age),
                    ip_address: r.ip_address.clone(),
                }
            })
            .collect();

        Ok(WarmPoolStatus {
            total: warm.len(),
            available,
            launching,
            busy,
            target: self.config.pool_size,
            instances,
            health: health(available, self.config.pool_size),
        })
    }

    /// Drop registry records whose instance no longer exists at the provider,
    /// then run [`maintain`](Self::maintain).
    ///
    /// Records the provider reports as stopped, terminated or unknown are
    /// deleted. Describe errors leave the record for the next pass.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let registry = self.launcher.registry();
        let records = registry
            .list_instances(&InstanceFilter::with_statuses(&InstanceStatus::ACTIVE))
            .await?;

        let mut removed = Vec::new();
        for record in records {
            let gone = match self.launcher.provider().describe(&record.instance_id).await {
                Ok(Some(desc)) => !desc.state.is_live(),
                Ok(None) | Err(ProviderError::NotFound(_)) => true,
                Err(e) => {
                    warn!(instance_id = %record.instance_id, error = %e, "Describe failed, skipping");
                    false
                }
            };

            if gone && registry.delete_instance(&record.instance_id).await? {
                info!(
                    instance_id = %record.instance_id,
                    status = %record.status,
                    "Removed stale instance record"
                );
                removed.push(record.instance_id);
            }
        }

        let maintenance = self.maintain().await?;
        Ok(ReconcileReport {
            removed,
            maintenance,
        })
    }
}

fn age_of(record: &InstanceRecord, now: DateTime<Utc>) -> Duration {
    record.age(now).to_std().unwrap_or_default()
}
