// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for loopfleet-core.
//!
//! Every state-changing method is a single conditional update: it checks the
//! current status and writes the new one atomically, returning whether the
//! write was applied. Callers never read-then-write to change status.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryRegistry;
pub use self::sqlite::SqliteRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::model::{
    ExecutionRecord, ExecutionStatus, InstanceFilter, InstanceRecord, InstanceStatus,
};

/// Storage for instance records.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a new instance record.
    async fn insert_instance(&self, record: &InstanceRecord) -> Result<(), CoreError>;

    /// Get an instance by ID.
    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError>;

    /// List instances matching a filter, least recently used first.
    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceRecord>, CoreError>;

    /// Count instances matching a filter.
    async fn count_instances(&self, filter: &InstanceFilter) -> Result<i64, CoreError>;

    /// Atomically claim the least recently used `available` instance with the
    /// given warm flag.
    ///
    /// The claimed record becomes `busy`, leaves the warm pool, records
    /// `execution_id` as its occupant and gets `last_used_at = now`.
    /// Two concurrent claims never return the same instance.
    async fn claim_available_instance(
        &self,
        warm: bool,
        execution_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<InstanceRecord>, CoreError>;

    /// Move a `launching` instance to `available`, or straight to `busy` when
    /// `assign_to` names the execution it was provisioned for.
    ///
    /// Without `assign_to` the execution back-reference is cleared. Returns
    /// false if the instance was not `launching`.
    async fn mark_instance_ready(
        &self,
        instance_id: &str,
        ip_address: Option<&str>,
        assign_to: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Return a `busy` or `available` instance to `available` and clear its
    /// execution back-reference. Never touches `launching`/`terminating`.
    async fn release_instance(&self, instance_id: &str, now: DateTime<Utc>)
    -> Result<bool, CoreError>;

    /// Mark an instance `terminating` and stamp the tombstone time.
    ///
    /// Returns false if the instance is missing or already terminating.
    async fn mark_instance_terminating(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Mark an instance `terminating` only if it is still warm and `available`.
    ///
    /// Used by rotation so an instance claimed in the meantime is left alone.
    async fn retire_warm_instance(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Remove an instance record.
    async fn delete_instance(&self, instance_id: &str) -> Result<bool, CoreError>;

    /// Remove `terminating` records whose tombstone is older than `cutoff`.
    ///
    /// Returns the IDs that were removed.
    async fn delete_terminated_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, CoreError>;
}

/// Storage for execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a new execution record.
    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<(), CoreError>;

    /// Get an execution by ID.
    async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, CoreError>;

    /// List executions, optionally restricted to one status, oldest first.
    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionRecord>, CoreError>;

    /// `queued → running`, recording `started_at`.
    ///
    /// Returns false if the execution was not `queued`.
    async fn start_execution_if_queued(
        &self,
        execution_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Record the instance executing a `running` execution.
    async fn assign_execution_instance(
        &self,
        execution_id: &str,
        instance_id: &str,
    ) -> Result<bool, CoreError>;

    /// Write the latest progress snapshot while the execution is `running`.
    async fn update_progress_if_running(
        &self,
        execution_id: &str,
        progress: &str,
        current_step: i32,
    ) -> Result<bool, CoreError>;

    /// Move a `running` execution to a terminal status.
    ///
    /// `current_step` of `None` leaves the stored step untouched. Returns false
    /// (and writes nothing) if the execution was not `running`, which keeps
    /// terminal states absorbing.
    async fn finish_execution_if_running(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        progress: &str,
        current_step: Option<i32>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;
}

/// A registry holding both collections.
pub trait Registry: InstanceStore + ExecutionStore {}

impl<T: InstanceStore + ExecutionStore> Registry for T {}

/// Reject a terminal status write with a non-terminal target.
pub(crate) fn ensure_terminal(status: ExecutionStatus) -> Result<(), CoreError> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(CoreError::InvalidRecord {
            entity: "execution",
            details: format!("'{}' is not a terminal status", status),
        })
    }
}

/// Statuses from which `release_instance` may return an instance to the pool.
pub(crate) const RELEASABLE: [InstanceStatus; 2] = [InstanceStatus::Busy, InstanceStatus::Available];
