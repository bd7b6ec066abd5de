// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Loopfleet Environment - Compute Pool and Execution Orchestration
//!
//! This crate runs long-lived agent workloads on ephemeral cloud instances.
//! It keeps a warm pool of pre-provisioned instances, hands them out to
//! executions, dispatches the workload over a remote command channel and
//! polls progress until the run completes, fails or times out.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Orchestrator                                │
//! │          submit ─► start ─► acquire ─► dispatch ─► spawn monitor         │
//! └─────────────────────────────────────────────────────────────────────────┘
//!            │                    │                          │
//!            ▼                    ▼                          ▼
//! ┌────────────────────┐ ┌─────────────────────┐ ┌───────────────────────────┐
//! │  InstanceManager   │ │    SecretStore      │ │     ExecutionMonitor      │
//! │ warm ► available ► │ │ (credential by ref) │ │ read progress.txt, parse, │
//! │ cold launch        │ └─────────────────────┘ │ write step, recycle       │
//! └────────────────────┘                         └───────────────────────────┘
//!       │          │                                          │
//!       ▼          ▼                                          ▼
//! ┌──────────┐ ┌────────────────────┐              ┌─────────────────────────┐
//! │ WarmPool │ │  InstanceLauncher  │──describe──► │  Provisioner (cloud)    │
//! │ maintain │ │ ceiling, spot ►    │──launch────► │  CommandChannel (remote)│
//! │ rotate   │ │ on-demand, ready   │──terminate─► └─────────────────────────┘
//! └──────────┘ └────────────────────┘
//!       │                 │
//!       ▼                 ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                 Registry (loopfleet-core: SQLite / memory)             │
//! │                      instances, executions                            │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Instance Acquisition
//!
//! | Order | Source | Latency |
//! |-------|--------|---------|
//! | 1 | Warm pool (least recently used) | immediate |
//! | 2 | Non-warm `available` instance | immediate |
//! | 3 | Cold launch (spot, then on-demand) | boot time |
//! | 4 | `PoolExhausted` | caller retries |
//!
//! Launching, available and busy instances all count against
//! `max_instances`, including warm pool provisioning.
//!
//! # Progress Scale
//!
//! Executions report a coarse step from 1 to 10, estimated from the remote
//! runner's progress file. See [`progress`].
//!
//! # Configuration
//!
//! Environment variables:
//! - `LOOPFLEET_LAUNCH_TEMPLATE_ID` (required)
//! - `LOOPFLEET_DATABASE_URL` - registry database (default: `sqlite:.data/loopfleet.db?mode=rwc`)
//! - `LOOPFLEET_MAX_INSTANCES` - capacity ceiling (default: 5)
//! - `LOOPFLEET_WARM_POOL_SIZE` - warm pool target (default: 3)
//! - `LOOPFLEET_WARM_MAX_AGE_HOURS` - warm rotation age (default: 24)
//! - `LOOPFLEET_MONITOR_BUDGET_SECS` - execution budget (default: 3600)
//!
//! See [`config::Config`] for the full list.

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types.
pub mod error;

/// Instance provisioning, acquisition, recycle and termination.
pub mod lifecycle;

/// Background warm pool maintenance.
pub mod maintenance_worker;

/// Per-execution progress polling.
pub mod monitor;

/// Execution submission, start and resume.
pub mod orchestrator;

/// Progress file parsing.
pub mod progress;

/// Provisioning API and remote command channel contracts.
pub mod provider;

/// Remote scripts.
pub mod remote;

/// Embeddable runtime.
pub mod runtime;

/// Credential lookup.
pub mod secrets;

/// Expired tombstone removal.
pub mod tombstone_sweeper;

/// Warm pool management.
pub mod warm_pool;

pub use config::Config;
pub use error::Error;
pub use lifecycle::{InstanceLauncher, InstanceManager, LaunchPurpose};
pub use orchestrator::{NewExecution, Orchestrator, StartOutcome};
pub use runtime::FleetRuntime;
pub use warm_pool::WarmPool;
