// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for loopfleet-environment.
//!
//! [`FleetRuntime`] wires the registry, provider, command channel and secret
//! store into an [`Orchestrator`], resumes work left in flight by a previous
//! process, and runs the background workers.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use loopfleet_core::SqliteRegistry;
//! use loopfleet_environment::config::Config;
//! use loopfleet_environment::runtime::FleetRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let registry = Arc::new(SqliteRegistry::connect(&config.database_url).await?);
//!
//!     let runtime = FleetRuntime::builder()
//!         .registry(registry)
//!         .provisioner(provider)          // your cloud adapter
//!         .command_channel(channel)       // your remote command adapter
//!         .secret_store(secrets)
//!         .config(config)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let execution = runtime.orchestrator().submit(request).await?;
//!     runtime.orchestrator().start(&execution.execution_id).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use loopfleet_core::Registry;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::lifecycle::{InstanceLauncher, InstanceManager};
use crate::maintenance_worker::{MaintenanceWorker, MaintenanceWorkerConfig};
use crate::orchestrator::{Orchestrator, ResumeReport};
use crate::provider::{CommandChannel, Provisioner};
use crate::secrets::SecretStore;
use crate::tombstone_sweeper::{TombstoneSweeper, TombstoneSweeperConfig};
use crate::warm_pool::WarmPool;

/// Builder for creating a [`FleetRuntime`].
pub struct FleetRuntimeBuilder {
    registry: Option<Arc<dyn Registry>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    command_channel: Option<Arc<dyn CommandChannel>>,
    secret_store: Option<Arc<dyn SecretStore>>,
    config: Option<Config>,
    run_maintenance_on_start: bool,
}

impl Default for FleetRuntimeBuilder {
    fn default() -> Self {
        Self {
            registry: None,
            provisioner: None,
            command_channel: None,
            secret_store: None,
            config: None,
            run_maintenance_on_start: true,
        }
    }
}

impl FleetRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the instance and execution registry (required).
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the provisioning API (required).
    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Set the remote command channel (required).
    pub fn command_channel(mut self, channel: Arc<dyn CommandChannel>) -> Self {
        self.command_channel = Some(channel);
        self
    }

    /// Set the secret store (required).
    pub fn secret_store(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secret_store = Some(secrets);
        self
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Whether the maintenance worker fills the pool right away.
    ///
    /// Default: true
    pub fn run_maintenance_on_start(mut self, enabled: bool) -> Self {
        self.run_maintenance_on_start = enabled;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<FleetRuntimeConfig> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;
        let provisioner = self
            .provisioner
            .ok_or_else(|| anyhow::anyhow!("provisioner is required"))?;
        let command_channel = self
            .command_channel
            .ok_or_else(|| anyhow::anyhow!("command_channel is required"))?;
        let secret_store = self
            .secret_store
            .ok_or_else(|| anyhow::anyhow!("secret_store is required"))?;
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;

        Ok(FleetRuntimeConfig {
            registry,
            provisioner,
            command_channel,
            secret_store,
            config,
            run_maintenance_on_start: self.run_maintenance_on_start,
        })
    }
}

/// Configuration for a [`FleetRuntime`].
pub struct FleetRuntimeConfig {
    registry: Arc<dyn Registry>,
    provisioner: Arc<dyn Provisioner>,
    command_channel: Arc<dyn CommandChannel>,
    secret_store: Arc<dyn SecretStore>,
    config: Config,
    run_maintenance_on_start: bool,
}

impl FleetRuntimeConfig {
    /// Start the runtime: resume in-flight work, then spawn the workers.
    pub async fn start(self) -> Result<FleetRuntime> {
        let config = self.config;

        let launcher = InstanceLauncher::new(
            self.registry.clone(),
            self.provisioner,
            config.provisioning.clone(),
        );
        let warm_pool = WarmPool::new(launcher.clone(), config.warm_pool.clone());
        let instances = InstanceManager::new(launcher.clone(), warm_pool.clone());
        let orchestrator = Orchestrator::new(
            self.registry.clone(),
            instances.clone(),
            self.command_channel,
            self.secret_store,
            config.monitor.clone(),
            config.remote.clone(),
        );

        let resumed = orchestrator.resume().await?;

        let maintenance_worker = MaintenanceWorker::new(
            warm_pool.clone(),
            MaintenanceWorkerConfig {
                poll_interval: config.maintenance_interval,
                run_on_start: self.run_maintenance_on_start,
            },
        );
        let maintenance_shutdown = maintenance_worker.shutdown_handle();
        let maintenance_handle = tokio::spawn(async move {
            maintenance_worker.run().await;
        });

        let sweeper = TombstoneSweeper::new(
            launcher,
            TombstoneSweeperConfig {
                poll_interval: config.sweep_interval,
                grace: config.provisioning.termination_grace,
            },
        );
        let sweeper_shutdown = sweeper.shutdown_handle();
        let sweeper_handle = tokio::spawn(async move {
            sweeper.run().await;
        });

        info!(
            max_instances = config.provisioning.max_instances,
            warm_pool_size = config.warm_pool.pool_size,
            resumed_monitors = resumed.monitors.len(),
            "FleetRuntime started"
        );

        Ok(FleetRuntime {
            maintenance_handle,
            sweeper_handle,
            maintenance_shutdown,
            sweeper_shutdown,
            orchestrator,
            warm_pool,
            instances,
            resumed: Some(resumed),
        })
    }
}

/// A running fleet that can be embedded in an application.
///
/// The runtime manages:
/// - Maintenance worker keeping the warm pool at target
/// - Tombstone sweeper removing expired `terminating` records
/// - Monitors re-attached to executions that were running at startup
///
/// Call [`shutdown`](Self::shutdown) for graceful termination. Monitor tasks
/// are not cancelled by shutdown.
pub struct FleetRuntime {
    maintenance_handle: JoinHandle<()>,
    sweeper_handle: JoinHandle<()>,
    maintenance_shutdown: Arc<Notify>,
    sweeper_shutdown: Arc<Notify>,
    orchestrator: Orchestrator,
    warm_pool: WarmPool,
    instances: InstanceManager,
    resumed: Option<ResumeReport>,
}

impl FleetRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FleetRuntimeBuilder {
        FleetRuntimeBuilder::new()
    }

    /// Submit and start executions.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Inspect and maintain the warm pool.
    pub fn warm_pool(&self) -> &WarmPool {
        &self.warm_pool
    }

    /// Acquire, recycle and terminate instances directly.
    pub fn instances(&self) -> &InstanceManager {
        &self.instances
    }

    /// Take the report of work resumed at startup. Returns `None` after the
    /// first call.
    pub fn take_resume_report(&mut self) -> Option<ResumeReport> {
        self.resumed.take()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals both workers to stop, then waits for them to complete.
    pub async fn shutdown(self) -> Result<()> {
        info!("FleetRuntime shutting down...");

        self.maintenance_shutdown.notify_one();
        self.sweeper_shutdown.notify_one();

        if let Err(e) = self.maintenance_handle.await {
            error!("Maintenance worker task panicked: {}", e);
        }

        if let Err(e) = self.sweeper_handle.await {
            error!("Tombstone sweeper task panicked: {}", e);
        }

        info!("FleetRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.maintenance_handle.is_finished() && !self.sweeper_handle.is_finished()
    }
}
