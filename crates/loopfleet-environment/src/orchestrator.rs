// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution orchestration.
//!
//! `start` drives a queued execution through acquisition and dispatch, then
//! hands it to a spawned [`ExecutionMonitor`]. Any failure before the monitor
//! starts marks the execution `failed` with `"Error: <message>"` as its
//! progress, and returns the instance if one was already acquired.

use std::sync::Arc;

use chrono::Utc;
use loopfleet_core::{ExecutionRecord, ExecutionStatus, Registry};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{MonitorConfig, RemoteConfig};
use crate::error::{Error, Result};
use crate::lifecycle::InstanceManager;
use crate::monitor::ExecutionMonitor;
use crate::provider::CommandChannel;
use crate::remote::{workload_options, workload_script};
use crate::secrets::SecretStore;

const INTERRUPTED: &str = "orchestration interrupted before an instance was assigned";

/// A request to run a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExecution {
    /// Owning workload definition.
    pub workload_id: String,
    /// Secret-store reference for the credential.
    pub credential_ref: String,
    /// Credential provider label passed to the runner.
    pub credential_provider: String,
    /// Unit-of-work definition, snapshotted into the execution.
    pub work_spec: serde_json::Value,
}

/// Result of [`Orchestrator::start`].
#[derive(Debug)]
pub enum StartOutcome {
    /// The workload is running and a monitor task is watching it.
    Dispatched {
        /// Instance running the workload.
        instance_id: String,
        /// Resolves to the terminal status once monitoring ends.
        monitor: JoinHandle<ExecutionStatus>,
    },
    /// Orchestration failed and the execution was marked `failed`, unless
    /// something else had already finished it.
    Failed {
        /// Why the workload was not dispatched. Stored as the execution's
        /// progress when this call finished it.
        reason: String,
    },
}

/// Result of [`Orchestrator::resume`].
#[derive(Debug, Default)]
pub struct ResumeReport {
    /// Re-attached monitors, by execution id.
    pub monitors: Vec<(String, JoinHandle<ExecutionStatus>)>,
    /// Executions failed because they never got an instance.
    pub failed: Vec<String>,
    /// Readiness waits resumed for `launching` instances.
    pub launching: Vec<JoinHandle<()>>,
}

/// Drives executions from `queued` to a terminal state.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<dyn Registry>,
    instances: InstanceManager,
    channel: Arc<dyn CommandChannel>,
    secrets: Arc<dyn SecretStore>,
    monitor: ExecutionMonitor,
    monitor_config: MonitorConfig,
    remote: RemoteConfig,
}

impl Orchestrator {
    /// Create an orchestrator.
    pub fn new(
        registry: Arc<dyn Registry>,
        instances: InstanceManager,
        channel: Arc<dyn CommandChannel>,
        secrets: Arc<dyn SecretStore>,
        monitor_config: MonitorConfig,
        remote: RemoteConfig,
    ) -> Self {
        let monitor = ExecutionMonitor::new(
            registry.clone(),
            instances.clone(),
            channel.clone(),
            monitor_config.clone(),
            remote.clone(),
        );
        Self {
            registry,
            instances,
            channel,
            secrets,
            monitor,
            monitor_config,
            remote,
        }
    }

    /// Record a new execution in `queued`.
    pub async fn submit(&self, request: NewExecution) -> Result<ExecutionRecord> {
        let record = ExecutionRecord::queued(
            uuid::Uuid::new_v4().to_string(),
            request.workload_id,
            request.credential_ref,
            request.credential_provider,
            request.work_spec,
            Utc::now(),
        );
        self.registry.insert_execution(&record).await?;

        info!(
            execution_id = %record.execution_id,
            workload_id = %record.workload_id,
            "Execution queued"
        );
        Ok(record)
    }

    /// Look up an execution.
    pub async fn get(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.registry
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))
    }

    /// Start a queued execution.
    ///
    /// Returns an error, without changing anything, if the execution does not
    /// exist or is not `queued`. Failures after that point are recorded on
    /// the execution and reported as [`StartOutcome::Failed`].
    pub async fn start(&self, execution_id: &str) -> Result<StartOutcome> {
        let record = self.get(execution_id).await?;
        if record.status != ExecutionStatus::Queued
            || !self
                .registry
                .start_execution_if_queued(execution_id, Utc::now())
                .await?
        {
            let status = self
                .registry
                .get_execution(execution_id)
                .await?
                .map_or(record.status, |r| r.status);
            return Err(Error::InvalidExecutionState {
                execution_id: execution_id.to_string(),
                status,
                expected: ExecutionStatus::Queued,
            });
        }

        info!(execution_id = %execution_id, workload_id = %record.workload_id, "Execution starting");

        let instance_id = match self.instances.acquire_instance(execution_id).await {
            Ok(instance_id) => instance_id,
            Err(e) => return self.fail(execution_id, None, e).await,
        };

        match self
            .registry
            .assign_execution_instance(execution_id, &instance_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Moved out of running while the instance was acquired.
                let status = self.get(execution_id).await?.status;
                warn!(
                    execution_id = %execution_id,
                    instance_id = %instance_id,
                    status = %status,
                    "Execution left running before dispatch"
                );
                let error = Error::InvalidExecutionState {
                    execution_id: execution_id.to_string(),
                    status,
                    expected: ExecutionStatus::Running,
                };
                return self.fail(execution_id, Some(&instance_id), error).await;
            }
            Err(e) => return self.fail(execution_id, Some(&instance_id), e.into()).await,
        }

        if let Err(e) = self.dispatch(&record, &instance_id).await {
            return self.fail(execution_id, Some(&instance_id), e).await;
        }

        let monitor = self.spawn_monitor(execution_id, &instance_id);
        Ok(StartOutcome::Dispatched {
            instance_id,
            monitor,
        })
    }

    async fn dispatch(&self, record: &ExecutionRecord, instance_id: &str) -> Result<()> {
        let credential = self.secrets.get(&record.credential_ref).await?;
        let script = workload_script(
            &self.remote,
            &record.execution_id,
            &record.work_spec.to_string(),
            &credential,
            &record.credential_provider,
        );

        let command_id = self
            .channel
            .dispatch(
                instance_id,
                &script,
                &workload_options(self.monitor_config.budget),
            )
            .await
            .map_err(|e| Error::Dispatch(e.to_string()))?;

        info!(
            execution_id = %record.execution_id,
            instance_id = %instance_id,
            command_id = %command_id,
            "Workload dispatched"
        );
        Ok(())
    }

    fn spawn_monitor(&self, execution_id: &str, instance_id: &str) -> JoinHandle<ExecutionStatus> {
        let monitor = self.monitor.clone();
        let execution_id = execution_id.to_string();
        let instance_id = instance_id.to_string();
        tokio::spawn(async move { monitor.run(&execution_id, &instance_id).await })
    }

    async fn fail(
        &self,
        execution_id: &str,
        instance_id: Option<&str>,
        error: Error,
    ) -> Result<StartOutcome> {
        let reason = format!("Error: {}", error);
        error!(execution_id = %execution_id, error = %error, "Execution failed to start");

        self.registry
            .finish_execution_if_running(
                execution_id,
                ExecutionStatus::Failed,
                &reason,
                None,
                Utc::now(),
            )
            .await?;

        if let Some(instance_id) = instance_id {
            self.instances.recycle_instance(instance_id).await?;
        }

        Ok(StartOutcome::Failed { reason })
    }

    /// Re-attach to work left in flight by a previous process.
    ///
    /// Running executions with an instance get a fresh monitor, with a fresh
    /// budget. Running executions without one are failed, since the
    /// acquisition that was in progress cannot be resumed. Instances still
    /// `launching` get their readiness wait resumed.
    pub async fn resume(&self) -> Result<ResumeReport> {
        let mut report = ResumeReport::default();

        for record in self
            .registry
            .list_executions(Some(ExecutionStatus::Running))
            .await?
        {
            match record.instance_id.as_deref() {
                Some(instance_id) => {
                    info!(execution_id = %record.execution_id, instance_id = %instance_id, "Resuming monitor");
                    let handle = self.spawn_monitor(&record.execution_id, instance_id);
                    report.monitors.push((record.execution_id, handle));
                }
                None => {
                    warn!(execution_id = %record.execution_id, "Failing execution without instance");
                    self.registry
                        .finish_execution_if_running(
                            &record.execution_id,
                            ExecutionStatus::Failed,
                            &format!("Error: {}", INTERRUPTED),
                            None,
                            Utc::now(),
                        )
                        .await?;
                    report.failed.push(record.execution_id);
                }
            }
        }

        report.launching = self.instances.launcher().resume_launching().await?;

        info!(
            monitors = report.monitors.len(),
            failed = report.failed.len(),
            launching = report.launching.len(),
            "Resume finished"
        );
        Ok(report)
    }
}
