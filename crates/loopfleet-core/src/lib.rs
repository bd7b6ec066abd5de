// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Loopfleet Core - Instance and Execution Registry
//!
//! This crate holds the durable state of a loopfleet deployment: which remote
//! compute instances exist and what they are doing, and which workload
//! executions have been submitted and how far they have progressed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        loopfleet-environment                             │
//! │     (Instance Manager, Warm Pool, Orchestrator, Progress Monitor)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    │ InstanceStore / ExecutionStore
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       loopfleet-core (This Crate)                        │
//! │                  Conditional, single-step state updates                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                              │
//!           ▼                                              ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │        SQLite         │                    │          Memory             │
//! │   (SqliteRegistry)    │                    │      (MemoryRegistry)       │
//! └───────────────────────┘                    └─────────────────────────────┘
//! ```
//!
//! # Instance Status State Machine
//!
//! ```text
//!   ┌───────────┐  ready   ┌───────────┐  claim   ┌──────┐
//!   │ LAUNCHING │─────────►│ AVAILABLE │─────────►│ BUSY │
//!   └─────┬─────┘          └─────┬─────┘◄─────────└──┬───┘
//!         │ ready(assign)        │        release    │
//!         └──────────────────────┼──────────────────►│
//!                                │                   │
//!                                ▼                   ▼
//!                         ┌─────────────┐   sweep
//!                         │ TERMINATING │──────────► (deleted)
//!                         └─────────────┘
//! ```
//!
//! Any non-terminating instance may be moved to `TERMINATING`. A terminating
//! record is a tombstone: it is never released, claimed or counted against
//! capacity, and is deleted once its grace window passes.
//!
//! # Execution Status State Machine
//!
//! | Status | Description |
//! |--------|-------------|
//! | `QUEUED` | Submitted, not yet picked up |
//! | `RUNNING` | Instance being acquired, or workload in flight |
//! | `COMPLETED` | Remote runner reported completion |
//! | `FAILED` | Acquisition, dispatch or remote failure, or timeout |
//!
//! `COMPLETED` and `FAILED` are absorbing: every write to an execution is
//! conditioned on its current status, so late progress snapshots after a
//! terminal transition are silently dropped.
//!
//! # Modules
//!
//! - [`model`]: Records, statuses and filters
//! - [`persistence`]: Store traits with SQLite and in-memory backends
//! - [`migrations`]: Embedded SQLite schema
//! - [`error`]: Registry error type

#![deny(missing_docs)]

/// Registry error type.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Instance and execution records.
pub mod model;

/// Store traits and backends.
pub mod persistence;

pub use error::{CoreError, Result};
pub use model::{
    DEFAULT_TOTAL_STEPS, ExecutionRecord, ExecutionStatus, InstanceFilter, InstanceRecord,
    InstanceStatus, MarketType,
};
pub use persistence::{
    ExecutionStore, InstanceStore, MemoryRegistry, Registry, SqliteRegistry,
};
