// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry data model.
//!
//! Instances and executions are independent collections. They are correlated
//! only through `InstanceRecord::current_execution_id` and
//! `ExecutionRecord::instance_id`; neither owns the other.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Default number of coarse progress steps reported for an execution.
pub const DEFAULT_TOTAL_STEPS: i32 = 10;

/// Lifecycle status of a remote compute instance.
///
/// ```text
/// launching ──ready──► available ──claim──► busy
///     │                   ▲   │               │
///     │                   └───┼───release─────┘
///     └───────────────────────┴──► terminating ──sweep──► (deleted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Provisioned, waiting for the readiness probe to pass.
    Launching,
    /// Ready and unassigned.
    Available,
    /// Assigned to an execution.
    Busy,
    /// Termination requested; the record is a tombstone until swept.
    Terminating,
}

impl InstanceStatus {
    /// Statuses that count against the capacity ceiling.
    pub const ACTIVE: [InstanceStatus; 3] = [Self::Launching, Self::Available, Self::Busy];

    /// Get the status string as stored in the registry.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Launching => "launching",
            Self::Available => "available",
            Self::Busy => "busy",
            Self::Terminating => "terminating",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "launching" => Ok(Self::Launching),
            "available" => Ok(Self::Available),
            "busy" => Ok(Self::Busy),
            "terminating" => Ok(Self::Terminating),
            other => Err(CoreError::InvalidRecord {
                entity: "instance",
                details: format!("unknown status '{}'", other),
            }),
        }
    }
}

/// Which provider offering an instance was launched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    /// Discounted, interruptible capacity.
    Spot,
    /// Standard, non-interruptible capacity.
    OnDemand,
}

impl MarketType {
    /// Get the market string as stored in the registry.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::OnDemand => "on_demand",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spot" => Ok(Self::Spot),
            "on_demand" => Ok(Self::OnDemand),
            other => Err(CoreError::InvalidRecord {
                entity: "instance",
                details: format!("unknown market '{}'", other),
            }),
        }
    }
}

/// One remote compute unit tracked by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Provider-assigned instance identifier.
    pub instance_id: String,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// True while held in the warm pool. Only valid with `launching`/`available`.
    pub is_warm: bool,
    /// Offering the instance runs on.
    pub market: MarketType,
    /// Network address, populated once the instance reports ready.
    pub ip_address: Option<String>,
    /// Execution currently occupying the instance. Always set while `busy`.
    pub current_execution_id: Option<String>,
    /// When the instance was provisioned.
    pub created_at: DateTime<Utc>,
    /// Last time the instance was handed out or released.
    pub last_used_at: DateTime<Utc>,
    /// Set when the instance entered `terminating`.
    pub terminating_since: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// Build a freshly provisioned record in `launching`.
    pub fn launching(
        instance_id: impl Into<String>,
        market: MarketType,
        is_warm: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            status: InstanceStatus::Launching,
            is_warm,
            market,
            ip_address: None,
            current_execution_id: None,
            created_at: now,
            last_used_at: now,
            terminating_since: None,
        }
    }

    /// Age of the instance relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Filter for instance queries. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    /// Match any of these statuses.
    pub statuses: Vec<InstanceStatus>,
    /// Match the warm flag.
    pub is_warm: Option<bool>,
}

impl InstanceFilter {
    /// Match instances in any of the given statuses.
    pub fn with_statuses(statuses: &[InstanceStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            is_warm: None,
        }
    }

    /// Restrict to warm or non-warm instances.
    pub fn warm(mut self, is_warm: bool) -> Self {
        self.is_warm = Some(is_warm);
        self
    }

    /// Check whether a record satisfies this filter.
    pub fn matches(&self, record: &InstanceRecord) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&record.status))
            && self.is_warm.is_none_or(|w| w == record.is_warm)
    }
}

/// Status of one workload execution.
///
/// `queued → running → {completed | failed}`. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Submitted, not yet picked up.
    Queued,
    /// Instance acquired (or being acquired) and workload in flight.
    Running,
    /// Remote workload reported completion.
    Completed,
    /// Acquisition, dispatch, remote failure or timeout.
    Failed,
}

impl ExecutionStatus {
    /// Get the status string as stored in the registry.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::InvalidRecord {
                entity: "execution",
                details: format!("unknown status '{}'", other),
            }),
        }
    }
}

/// One run of a workload against a remote instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique execution identifier.
    pub execution_id: String,
    /// Owning workload definition.
    pub workload_id: String,
    /// Opaque secret-store reference for the credential. Never the secret itself.
    pub credential_ref: String,
    /// Credential provider label passed to the remote runner.
    pub credential_provider: String,
    /// Snapshot of the unit-of-work definition sent to the instance.
    pub work_spec: serde_json::Value,
    /// Current status.
    pub status: ExecutionStatus,
    /// Latest snapshot of remote output, or the failure reason.
    pub progress: Option<String>,
    /// Coarse progress position.
    pub current_step: i32,
    /// Coarse progress scale.
    pub total_steps: i32,
    /// Instance currently executing this run.
    pub instance_id: Option<String>,
    /// When the execution was submitted.
    pub created_at: DateTime<Utc>,
    /// When orchestration started.
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Build a new record in `queued`.
    pub fn queued(
        execution_id: impl Into<String>,
        workload_id: impl Into<String>,
        credential_ref: impl Into<String>,
        credential_provider: impl Into<String>,
        work_spec: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            workload_id: workload_id.into(),
            credential_ref: credential_ref.into(),
            credential_provider: credential_provider.into(),
            work_spec,
            status: ExecutionStatus::Queued,
            progress: None,
            current_step: 0,
            total_steps: DEFAULT_TOTAL_STEPS,
            instance_id: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}
