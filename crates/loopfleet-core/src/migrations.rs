// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded registry schema.
//!
//! Products embedding loopfleet-core against their own pool call
//! [`run_sqlite`] before constructing a [`crate::SqliteRegistry`].
//!
//! ```ignore
//! let pool = sqlx::SqlitePool::connect("sqlite:fleet.db?mode=rwc").await?;
//! loopfleet_core::migrations::run_sqlite(&pool).await?;
//! let registry = loopfleet_core::SqliteRegistry::new(pool);
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with the instance and execution tables embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Safe to call repeatedly; applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
