// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for loopfleet-environment tests.
//!
//! Provides [`Fleet`], a fully wired orchestrator over the in-memory registry
//! and the mock provider, command channel and secret store.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use loopfleet_core::{
    ExecutionRecord, InstanceFilter, InstanceRecord, InstanceStatus, InstanceStore,
    MemoryRegistry, Registry,
};
use loopfleet_environment::config::{
    Config, MonitorConfig, ProvisioningConfig, RemoteConfig, WarmPoolConfig,
};
use loopfleet_environment::lifecycle::{InstanceLauncher, InstanceManager};
use loopfleet_environment::orchestrator::{NewExecution, Orchestrator};
use loopfleet_environment::provider::{MockCommandChannel, MockProvider};
use loopfleet_environment::secrets::MemorySecretStore;
use loopfleet_environment::warm_pool::WarmPool;
use serde_json::json;

pub const CREDENTIAL_REF: &str = "keys/anthropic";
pub const CREDENTIAL: &str = "sk-ant-test-credential";

/// Install a test log subscriber once. `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Configuration with fast readiness polling and the default monitor budget.
pub fn test_config(max_instances: i64, pool_size: usize) -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        provisioning: ProvisioningConfig {
            launch_template_id: "lt-test".to_string(),
            max_instances,
            ready_poll_interval: Duration::from_millis(10),
            ready_max_attempts: 5,
            ..Default::default()
        },
        warm_pool: WarmPoolConfig {
            pool_size,
            ..Default::default()
        },
        monitor: MonitorConfig::default(),
        remote: RemoteConfig::default(),
        maintenance_interval: Duration::from_secs(900),
        sweep_interval: Duration::from_secs(30),
    }
}

/// A wired fleet over mocks.
pub struct Fleet {
    pub registry: Arc<MemoryRegistry>,
    pub provider: Arc<MockProvider>,
    pub channel: Arc<MockCommandChannel>,
    pub secrets: Arc<MemorySecretStore>,
    pub config: Config,
    pub launcher: InstanceLauncher,
    pub warm_pool: WarmPool,
    pub instances: InstanceManager,
    pub orchestrator: Orchestrator,
}

impl Fleet {
    /// Fleet with a default mock provider.
    pub async fn new(max_instances: i64, pool_size: usize) -> Self {
        Self::with_provider(MockProvider::new(), test_config(max_instances, pool_size)).await
    }

    /// Fleet with a custom provider and configuration.
    pub async fn with_provider(provider: MockProvider, config: Config) -> Self {
        Self::with_parts(provider, MockCommandChannel::new(), config).await
    }

    /// Fleet with a custom provider, channel and configuration.
    pub async fn with_parts(
        provider: MockProvider,
        channel: MockCommandChannel,
        config: Config,
    ) -> Self {
        init_tracing();
        let registry = Arc::new(MemoryRegistry::new());
        let provider = Arc::new(provider);
        let channel = Arc::new(channel);
        let secrets = Arc::new(MemorySecretStore::new());
        secrets.put(CREDENTIAL_REF, CREDENTIAL).await;

        let launcher = InstanceLauncher::new(
            registry.clone(),
            provider.clone(),
            config.provisioning.clone(),
        );
        let warm_pool = WarmPool::new(launcher.clone(), config.warm_pool.clone());
        let instances = InstanceManager::new(launcher.clone(), warm_pool.clone());
        let orchestrator = Orchestrator::new(
            registry.clone(),
            instances.clone(),
            channel.clone(),
            secrets.clone(),
            config.monitor.clone(),
            config.remote.clone(),
        );

        Self {
            registry,
            provider,
            channel,
            secrets,
            config,
            launcher,
            warm_pool,
            instances,
            orchestrator,
        }
    }

    /// The registry as a trait object.
    pub fn dyn_registry(&self) -> Arc<dyn Registry> {
        self.registry.clone()
    }

    /// Fetch an instance that must exist.
    pub async fn instance(&self, instance_id: &str) -> InstanceRecord {
        self.registry
            .get_instance(instance_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("instance {} not found", instance_id))
    }

    /// Fetch an execution that must exist.
    pub async fn execution(&self, execution_id: &str) -> ExecutionRecord {
        self.orchestrator.get(execution_id).await.unwrap()
    }

    /// Count instances in any of `statuses`.
    pub async fn count(&self, statuses: &[InstanceStatus]) -> i64 {
        self.registry
            .count_instances(&InstanceFilter::with_statuses(statuses))
            .await
            .unwrap()
    }

    /// Count warm instances in any of `statuses`.
    pub async fn count_warm(&self, statuses: &[InstanceStatus]) -> i64 {
        self.registry
            .count_instances(&InstanceFilter::with_statuses(statuses).warm(true))
            .await
            .unwrap()
    }

    /// Submit an execution with a small work spec.
    pub async fn submit(&self) -> ExecutionRecord {
        self.orchestrator.submit(new_execution()).await.unwrap()
    }
}

/// A request with two units of work.
pub fn new_execution() -> NewExecution {
    NewExecution {
        workload_id: "workload-1".to_string(),
        credential_ref: CREDENTIAL_REF.to_string(),
        credential_provider: "anthropic".to_string(),
        work_spec: json!({
            "project": "demo",
            "userStories": [
                { "id": "US-001", "title": "Add login form" },
                { "id": "US-002", "title": "Add logout button" }
            ]
        }),
    }
}

/// Let spawned background tasks run to completion.
///
/// Under paused time this returns as soon as every task is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}
