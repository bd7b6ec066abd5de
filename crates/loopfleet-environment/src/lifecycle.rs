// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle: provisioning, readiness, acquisition, recycle and
//! termination of single instances.
//!
//! [`InstanceLauncher`] owns the provider-facing primitives and is shared by
//! the warm pool and the [`InstanceManager`]. The manager layers the
//! acquisition fallback chain on top:
//!
//! 1. a warm instance from the [`WarmPool`]
//! 2. any non-warm `available` instance
//! 3. a cold launch, if the capacity ceiling allows
//! 4. otherwise [`Error::PoolExhausted`]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use loopfleet_core::{
    ExecutionStatus, InstanceFilter, InstanceRecord, InstanceStatus, MarketType, Registry,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ProvisioningConfig;
use crate::error::{Error, Result};
use crate::provider::{LaunchSpec, ProviderError, Provisioner};
use crate::warm_pool::WarmPool;

/// Why an instance is being launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchPurpose {
    /// Joins the warm pool once ready.
    Warm,
    /// Goes straight to `busy` for this execution once ready.
    Assigned(String),
}

impl LaunchPurpose {
    fn is_warm(&self) -> bool {
        matches!(self, Self::Warm)
    }

    fn assignee(&self) -> Option<&str> {
        match self {
            Self::Warm => None,
            Self::Assigned(execution_id) => Some(execution_id),
        }
    }
}

/// Provider-facing instance primitives.
#[derive(Clone)]
pub struct InstanceLauncher {
    registry: Arc<dyn Registry>,
    provider: Arc<dyn Provisioner>,
    config: ProvisioningConfig,
    // Serializes the capacity check with the launch and record insert.
    launch_gate: Arc<Mutex<()>>,
}

impl InstanceLauncher {
    /// Create a launcher.
    pub fn new(
        registry: Arc<dyn Registry>,
        provider: Arc<dyn Provisioner>,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            registry,
            provider,
            config,
            launch_gate: Arc::new(Mutex::new(())),
        }
    }

    /// The registry this launcher writes to.
    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// The provisioning API.
    pub fn provider(&self) -> &Arc<dyn Provisioner> {
        &self.provider
    }

    /// Provisioning settings.
    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    /// Instances counted against the capacity ceiling.
    pub async fn active_count(&self) -> Result<i64> {
        Ok(self
            .registry
            .count_instances(&InstanceFilter::with_statuses(&InstanceStatus::ACTIVE))
            .await?)
    }

    /// Build the launch request for a warm or cold instance.
    pub fn launch_spec(&self, warm: bool) -> LaunchSpec {
        let mut tags = BTreeMap::new();
        let name = if warm { "warm-pool" } else { "runner" };
        tags.insert(
            "Name".to_string(),
            format!("{}-{}", self.config.project_tag, name),
        );
        tags.insert("Project".to_string(), self.config.project_tag.clone());
        if warm {
            tags.insert("WarmPool".to_string(), "true".to_string());
        }

        LaunchSpec {
            launch_template_id: self.config.launch_template_id.clone(),
            max_price: self.config.spot_max_price.clone(),
            tags,
        }
    }

    /// Launch one instance and record it as `launching`.
    ///
    /// Fails with [`Error::PoolExhausted`] if the ceiling is already reached.
    pub async fn launch(&self, purpose: &LaunchPurpose) -> Result<InstanceRecord> {
        let _gate = self.launch_gate.lock().await;

        let active = self.active_count().await?;
        if active >= self.config.max_instances {
            return Err(Error::PoolExhausted {
                active,
                max: self.config.max_instances,
            });
        }

        let spec = self.launch_spec(purpose.is_warm());
        let (instance_id, market) = self.launch_with_fallback(&spec).await?;

        let mut record =
            InstanceRecord::launching(&instance_id, market, purpose.is_warm(), Utc::now());
        record.current_execution_id = purpose.assignee().map(str::to_string);

        if let Err(e) = self.registry.insert_instance(&record).await {
            error!(
                instance_id = %instance_id,
                error = %e,
                "Failed to record launched instance, terminating it"
            );
            if let Err(te) = self.provider.terminate(&instance_id).await {
                error!(instance_id = %instance_id, error = %te, "Failed to terminate unrecorded instance");
            }
            return Err(e.into());
        }

        info!(
            instance_id = %instance_id,
            market = %market,
            warm = purpose.is_warm(),
            execution_id = purpose.assignee().unwrap_or(""),
            "Instance launched"
        );
        Ok(record)
    }

    /// Try spot first and fall back to on-demand when spot has no capacity.
    async fn launch_with_fallback(&self, spec: &LaunchSpec) -> Result<(String, MarketType)> {
        match self.provider.launch(spec, MarketType::Spot).await {
            Ok(instance_id) => Ok((instance_id, MarketType::Spot)),
            Err(ProviderError::CapacityUnavailable(reason)) => {
                warn!(reason = %reason, "Spot capacity unavailable, falling back to on-demand");
                let instance_id = self.provider.launch(spec, MarketType::OnDemand).await?;
                Ok((instance_id, MarketType::OnDemand))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until the provider reports the instance running with both health
    /// checks passing. Returns its address.
    ///
    /// Describe errors count as a failed probe. On timeout the record is left
    /// as is for a later reconcile or manual cleanup.
    pub async fn wait_until_ready(&self, instance_id: &str) -> Result<Option<String>> {
        let attempts = self.config.ready_max_attempts;

        for attempt in 1..=attempts {
            match self.provider.describe(instance_id).await {
                Ok(Some(desc)) if desc.is_ready() => {
                    debug!(instance_id = %instance_id, attempt, "Instance ready");
                    return Ok(desc.address);
                }
                Ok(Some(desc)) => {
                    debug!(instance_id = %instance_id, attempt, state = %desc.state, "Instance not ready yet");
                }
                Ok(None) => {
                    debug!(instance_id = %instance_id, attempt, "Instance not visible yet");
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, attempt, error = %e, "Readiness probe failed");
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.ready_poll_interval).await;
            }
        }

        warn!(instance_id = %instance_id, attempts, "Instance never became ready");
        Err(Error::ProvisioningTimeout {
            instance_id: instance_id.to_string(),
            attempts,
        })
    }

    /// Wait for readiness, then move the record out of `launching`.
    pub async fn complete_launch(&self, instance_id: &str, assign_to: Option<&str>) -> Result<()> {
        let address = self.wait_until_ready(instance_id).await?;

        let applied = self
            .registry
            .mark_instance_ready(instance_id, address.as_deref(), assign_to, Utc::now())
            .await?;
        if !applied {
            return Err(Error::InstanceUnavailable(instance_id.to_string()));
        }

        info!(
            instance_id = %instance_id,
            ip_address = address.as_deref().unwrap_or(""),
            assigned = assign_to.is_some(),
            "Instance ready"
        );
        Ok(())
    }

    /// Launch, wait for readiness and record the instance as ready.
    pub async fn provision(&self, purpose: LaunchPurpose) -> Result<InstanceRecord> {
        let record = self.launch(&purpose).await?;
        self.complete_launch(&record.instance_id, purpose.assignee())
            .await?;
        Ok(record)
    }

    /// Tombstone an instance and ask the provider to terminate it.
    ///
    /// The record stays as `terminating` until the sweeper removes it after
    /// the grace window. If the provider call fails the sweeper retries it
    /// before removing anything.
    pub async fn terminate(&self, instance_id: &str) -> Result<()> {
        let marked = self
            .registry
            .mark_instance_terminating(instance_id, Utc::now())
            .await?;
        if !marked {
            debug!(instance_id = %instance_id, "Instance already terminating or unknown");
        }
        self.issue_termination(instance_id).await
    }

    /// Retire a warm instance only if it is still warm and available.
    ///
    /// Returns false, without touching the provider, if it was claimed first.
    pub async fn retire_warm(&self, instance_id: &str) -> Result<bool> {
        if !self
            .registry
            .retire_warm_instance(instance_id, Utc::now())
            .await?
        {
            return Ok(false);
        }
        self.issue_termination(instance_id).await?;
        Ok(true)
    }

    /// Ask the provider to terminate. An instance it no longer knows counts
    /// as terminated.
    pub(crate) async fn issue_termination(&self, instance_id: &str) -> Result<()> {
        match self.provider.terminate(instance_id).await {
            Ok(()) => {
                info!(instance_id = %instance_id, "Instance termination requested");
                Ok(())
            }
            Err(ProviderError::NotFound(_)) => {
                warn!(instance_id = %instance_id, "Provider no longer knows instance");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resume readiness waits for instances left `launching` by a previous
    /// process.
    ///
    /// An instance provisioned for an execution that is still running and
    /// still points at it is assigned on readiness. Otherwise it becomes
    /// plain `available`.
    pub async fn resume_launching(&self) -> Result<Vec<JoinHandle<()>>> {
        let launching = self
            .registry
            .list_instances(&InstanceFilter::with_statuses(&[InstanceStatus::Launching]))
            .await?;

        let mut handles = Vec::with_capacity(launching.len());
        for record in launching {
            let assign_to = match record.current_execution_id.as_deref() {
                Some(execution_id) => self
                    .registry
                    .get_execution(execution_id)
                    .await?
                    .filter(|e| {
                        e.status == ExecutionStatus::Running
                            && e.instance_id.as_deref() == Some(record.instance_id.as_str())
                    })
                    .map(|e| e.execution_id),
                None => None,
            };

            info!(
                instance_id = %record.instance_id,
                warm = record.is_warm,
                "Resuming readiness wait"
            );

            let launcher = self.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = launcher
                    .complete_launch(&record.instance_id, assign_to.as_deref())
                    .await
                {
                    error!(instance_id = %record.instance_id, error = %e, "Resumed readiness wait failed");
                }
            }));
        }

        Ok(handles)
    }
}

/// Allocates instances to executions and returns them afterwards.
#[derive(Clone)]
pub struct InstanceManager {
    launcher: InstanceLauncher,
    warm_pool: WarmPool,
}

impl InstanceManager {
    /// Create a manager that consults `warm_pool` first.
    pub fn new(launcher: InstanceLauncher, warm_pool: WarmPool) -> Self {
        Self {
            launcher,
            warm_pool,
        }
    }

    /// The underlying launcher.
    pub fn launcher(&self) -> &InstanceLauncher {
        &self.launcher
    }

    /// Acquire a ready instance for `execution_id`, marked `busy` with the
    /// back-reference set.
    ///
    /// The spot to on-demand fallback is invisible here: only latency differs.
    pub async fn acquire_instance(&self, execution_id: &str) -> Result<String> {
        if let Some(instance_id) = self.warm_pool.get_warm_instance(execution_id).await? {
            info!(execution_id = %execution_id, instance_id = %instance_id, source = "warm", "Instance acquired");
            return Ok(instance_id);
        }

        if let Some(record) = self
            .launcher
            .registry()
            .claim_available_instance(false, execution_id, Utc::now())
            .await?
        {
            info!(execution_id = %execution_id, instance_id = %record.instance_id, source = "available", "Instance acquired");
            return Ok(record.instance_id);
        }

        let record = self
            .launcher
            .provision(LaunchPurpose::Assigned(execution_id.to_string()))
            .await?;
        info!(execution_id = %execution_id, instance_id = %record.instance_id, source = "cold", "Instance acquired");
        Ok(record.instance_id)
    }

    /// Return an instance to `available` and clear its back-reference.
    ///
    /// Idempotent. Instances that are `terminating`, `launching` or unknown
    /// are left alone.
    pub async fn recycle_instance(&self, instance_id: &str) -> Result<()> {
        let registry = self.launcher.registry();
        if registry.release_instance(instance_id, Utc::now()).await? {
            info!(instance_id = %instance_id, "Instance recycled");
            return Ok(());
        }

        match registry.get_instance(instance_id).await? {
            Some(record) => {
                warn!(instance_id = %instance_id, status = %record.status, "Instance not recyclable")
            }
            None => warn!(instance_id = %instance_id, "Cannot recycle unknown instance"),
        }
        Ok(())
    }

    /// Terminate an instance. See [`InstanceLauncher::terminate`].
    pub async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.launcher.terminate(instance_id).await
    }
}
