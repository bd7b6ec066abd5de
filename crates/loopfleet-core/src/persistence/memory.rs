// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory registry.
//!
//! Each operation runs under a single lock, which gives the same atomicity the
//! SQLite backend gets from single-statement conditional updates. Used by tests
//! and by embedders that do not need durability.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{ExecutionStore, InstanceStore, RELEASABLE, ensure_terminal};
use crate::error::CoreError;
use crate::model::{
    ExecutionRecord, ExecutionStatus, InstanceFilter, InstanceRecord, InstanceStatus,
};

#[derive(Default)]
struct State {
    instances: HashMap<String, InstanceRecord>,
    executions: HashMap<String, ExecutionRecord>,
}

/// Registry backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    state: Arc<Mutex<State>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

fn lru_order(a: &InstanceRecord, b: &InstanceRecord) -> std::cmp::Ordering {
    a.last_used_at
        .cmp(&b.last_used_at)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.instance_id.cmp(&b.instance_id))
}

#[async_trait]
impl InstanceStore for MemoryRegistry {
    async fn insert_instance(&self, record: &InstanceRecord) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if state.instances.contains_key(&record.instance_id) {
            return Err(CoreError::InstanceAlreadyExists {
                instance_id: record.instance_id.clone(),
            });
        }
        state
            .instances
            .insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        Ok(self.state.lock().await.instances.get(instance_id).cloned())
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<InstanceRecord> = state
            .instances
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(lru_order);
        Ok(records)
    }

    async fn count_instances(&self, filter: &InstanceFilter) -> Result<i64, CoreError> {
        let state = self.state.lock().await;
        Ok(state.instances.values().filter(|r| filter.matches(r)).count() as i64)
    }

    async fn claim_available_instance(
        &self,
        warm: bool,
        execution_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<InstanceRecord>, CoreError> {
        let mut state = self.state.lock().await;
        let candidate = state
            .instances
            .values()
            .filter(|r| r.status == InstanceStatus::Available && r.is_warm == warm)
            .min_by(|a, b| lru_order(a, b))
            .map(|r| r.instance_id.clone());

        let Some(instance_id) = candidate else {
            return Ok(None);
        };

        let record = state
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| CoreError::DatabaseError {
                operation: "claim_available_instance".to_string(),
                details: format!("instance '{}' vanished under lock", instance_id),
            })?;
        record.status = InstanceStatus::Busy;
        record.is_warm = false;
        record.current_execution_id = Some(execution_id.to_string());
        record.last_used_at = now;
        Ok(Some(record.clone()))
    }

    async fn mark_instance_ready(
        &self,
        instance_id: &str,
        ip_address: Option<&str>,
        assign_to: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.instances.get_mut(instance_id) else {
            return Ok(false);
        };
        if record.status != InstanceStatus::Launching {
            return Ok(false);
        }
        record.ip_address = ip_address.map(str::to_string);
        record.last_used_at = now;
        match assign_to {
            Some(execution_id) => {
                record.status = InstanceStatus::Busy;
                record.is_warm = false;
                record.current_execution_id = Some(execution_id.to_string());
            }
            None => {
                record.status = InstanceStatus::Available;
                record.current_execution_id = None;
            }
        }
        Ok(true)
    }

    async fn release_instance(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.instances.get_mut(instance_id) else {
            return Ok(false);
        };
        if !RELEASABLE.contains(&record.status) {
            return Ok(false);
        }
        record.status = InstanceStatus::Available;
        record.current_execution_id = None;
        record.last_used_at = now;
        Ok(true)
    }

    async fn mark_instance_terminating(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.instances.get_mut(instance_id) else {
            return Ok(false);
        };
        if record.status == InstanceStatus::Terminating {
            return Ok(false);
        }
        record.status = InstanceStatus::Terminating;
        record.is_warm = false;
        record.terminating_since = Some(now);
        Ok(true)
    }

    async fn retire_warm_instance(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        match state.instances.get_mut(instance_id) {
            Some(record) if record.status == InstanceStatus::Available && record.is_warm => {
                record.status = InstanceStatus::Terminating;
                record.is_warm = false;
                record.terminating_since = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<bool, CoreError> {
        Ok(self
            .state
            .lock()
            .await
            .instances
            .remove(instance_id)
            .is_some())
    }

    async fn delete_terminated_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, CoreError> {
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .instances
            .values()
            .filter(|r| {
                r.status == InstanceStatus::Terminating
                    && r.terminating_since.is_some_and(|t| t < cutoff)
            })
            .map(|r| r.instance_id.clone())
            .collect();
        for id in &expired {
            state.instances.remove(id);
        }
        Ok(expired)
    }
}

#[async_trait]
impl ExecutionStore for MemoryRegistry {
    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if state.executions.contains_key(&record.execution_id) {
            return Err(CoreError::ExecutionAlreadyExists {
                execution_id: record.execution_id.clone(),
            });
        }
        state
            .executions
            .insert(record.execution_id.clone(), record.clone());
        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, CoreError> {
        Ok(self.state.lock().await.executions.get(execution_id).cloned())
    }

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionRecord>, CoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<ExecutionRecord> = state
            .executions
            .values()
            .filter(|r| status.is_none_or(|s| s == r.status))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        Ok(records)
    }

    async fn start_execution_if_queued(
        &self,
        execution_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        match state.executions.get_mut(execution_id) {
            Some(record) if record.status == ExecutionStatus::Queued => {
                record.status = ExecutionStatus::Running;
                record.started_at = Some(started_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn assign_execution_instance(
        &self,
        execution_id: &str,
        instance_id: &str,
    ) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        match state.executions.get_mut(execution_id) {
            Some(record) if record.status == ExecutionStatus::Running => {
                record.instance_id = Some(instance_id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress_if_running(
        &self,
        execution_id: &str,
        progress: &str,
        current_step: i32,
    ) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        match state.executions.get_mut(execution_id) {
            Some(record) if record.status == ExecutionStatus::Running => {
                record.progress = Some(progress.to_string());
                record.current_step = current_step;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_execution_if_running(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        progress: &str,
        current_step: Option<i32>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        ensure_terminal(status)?;
        let mut state = self.state.lock().await;
        match state.executions.get_mut(execution_id) {
            Some(record) if record.status == ExecutionStatus::Running => {
                record.status = status;
                record.progress = Some(progress.to_string());
                if let Some(step) = current_step {
                    record.current_step = step;
                }
                record.completed_at = Some(completed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
