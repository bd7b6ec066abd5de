// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution monitor.
//!
//! One monitor task per dispatched execution. It polls the instance's
//! progress file until a completion or failure marker shows up or the
//! wall-clock budget runs out, writing each snapshot to the registry. The
//! instance is recycled on every exit path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use loopfleet_core::{ExecutionStatus, Registry};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{MonitorConfig, RemoteConfig};
use crate::error::Error;
use crate::lifecycle::InstanceManager;
use crate::progress::parse_progress;
use crate::provider::CommandChannel;
use crate::remote::read_progress;

/// Render a duration the way timeout messages show it.
pub fn describe_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (n, unit) = if secs >= 3600 && secs % 3600 == 0 {
        (secs / 3600, "hour")
    } else if secs >= 60 && secs % 60 == 0 {
        (secs / 60, "minute")
    } else {
        (secs, "second")
    };
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

/// Polls progress for running executions.
#[derive(Clone)]
pub struct ExecutionMonitor {
    registry: Arc<dyn Registry>,
    instances: InstanceManager,
    channel: Arc<dyn CommandChannel>,
    config: MonitorConfig,
    remote: RemoteConfig,
}

impl ExecutionMonitor {
    /// Create a monitor.
    pub fn new(
        registry: Arc<dyn Registry>,
        instances: InstanceManager,
        channel: Arc<dyn CommandChannel>,
        config: MonitorConfig,
        remote: RemoteConfig,
    ) -> Self {
        Self {
            registry,
            instances,
            channel,
            config,
            remote,
        }
    }

    /// Monitor `execution_id` on `instance_id` until it reaches a terminal
    /// state, then recycle the instance.
    ///
    /// Read failures are logged and retried on the next tick. If the
    /// execution stops being `running` for any other reason (for example it
    /// was failed externally) monitoring stops without writing.
    pub async fn run(&self, execution_id: &str, instance_id: &str) -> ExecutionStatus {
        info!(execution_id = %execution_id, instance_id = %instance_id, "Monitoring execution");

        let status = self.poll(execution_id, instance_id).await;

        if let Err(e) = self.instances.recycle_instance(instance_id).await {
            error!(instance_id = %instance_id, error = %e, "Failed to recycle instance");
        }

        info!(execution_id = %execution_id, status = %status, "Monitoring finished");
        status
    }

    async fn poll(&self, execution_id: &str, instance_id: &str) -> ExecutionStatus {
        let deadline = Instant::now() + self.config.budget;

        loop {
            if Instant::now() >= deadline {
                return self.time_out(execution_id).await;
            }

            let record = match self.registry.get_execution(execution_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!(execution_id = %execution_id, "Execution disappeared while monitored");
                    return ExecutionStatus::Failed;
                }
                Err(e) => {
                    warn!(execution_id = %execution_id, error = %e, "Failed to load execution");
                    self.sleep_until_next(deadline).await;
                    continue;
                }
            };
            if record.status != ExecutionStatus::Running {
                info!(execution_id = %execution_id, status = %record.status, "Execution no longer running");
                return record.status;
            }

            // One read may not outlive a poll cycle or the budget.
            let read_deadline =
                (Instant::now() + self.config.read_settle + self.config.poll_interval).min(deadline);
            let read = tokio::time::timeout_at(
                read_deadline,
                read_progress(
                    self.channel.as_ref(),
                    &self.remote,
                    self.config.read_settle,
                    instance_id,
                    execution_id,
                ),
            )
            .await;

            match read {
                Err(_) if Instant::now() >= deadline => {
                    return self.time_out(execution_id).await;
                }
                Err(_) => {
                    warn!(
                        execution_id = %execution_id,
                        instance_id = %instance_id,
                        "Progress read timed out"
                    );
                }
                Ok(Ok(raw)) => {
                    let signal = parse_progress(&raw);
                    let step = signal.current_step.min(record.total_steps);

                    if signal.is_complete {
                        return self
                            .finish(
                                execution_id,
                                ExecutionStatus::Completed,
                                &raw,
                                Some(record.total_steps),
                            )
                            .await;
                    }
                    if signal.is_failed {
                        return self
                            .finish(execution_id, ExecutionStatus::Failed, &raw, Some(step))
                            .await;
                    }

                    match self
                        .registry
                        .update_progress_if_running(execution_id, &raw, step)
                        .await
                    {
                        Ok(true) => debug!(execution_id = %execution_id, step, "Progress updated"),
                        Ok(false) => debug!(execution_id = %execution_id, "Progress write skipped"),
                        Err(e) => {
                            warn!(execution_id = %execution_id, error = %e, "Failed to write progress")
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(
                        execution_id = %execution_id,
                        instance_id = %instance_id,
                        error = %e,
                        "Progress read failed"
                    );
                }
            }

            self.sleep_until_next(deadline).await;
        }
    }

    async fn sleep_until_next(&self, deadline: Instant) {
        let next = (Instant::now() + self.config.poll_interval).min(deadline);
        tokio::time::sleep_until(next).await;
    }

    async fn time_out(&self, execution_id: &str) -> ExecutionStatus {
        let reason = Error::MonitoringTimeout(describe_duration(self.config.budget)).to_string();
        warn!(execution_id = %execution_id, budget_secs = self.config.budget.as_secs(), "Execution timed out");
        self.finish(execution_id, ExecutionStatus::Failed, &reason, None)
            .await
    }

    async fn finish(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        progress: &str,
        current_step: Option<i32>,
    ) -> ExecutionStatus {
        match self
            .registry
            .finish_execution_if_running(execution_id, status, progress, current_step, Utc::now())
            .await
        {
            Ok(true) => status,
            Ok(false) => {
                // Someone else moved it out of running first.
                match self.registry.get_execution(execution_id).await {
                    Ok(Some(record)) => record.status,
                    _ => status,
                }
            }
            Err(e) => {
                error!(execution_id = %execution_id, status = %status, error = %e, "Failed to record terminal status");
                status
            }
        }
    }
}
