// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed registry implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info};

use super::{ExecutionStore, InstanceStore, RELEASABLE, ensure_terminal};
use crate::error::CoreError;
use crate::migrations::SQLITE as MIGRATOR;
use crate::model::{
    ExecutionRecord, ExecutionStatus, InstanceFilter, InstanceRecord, InstanceStatus,
};

const INSTANCE_COLUMNS: &str = "instance_id, status, is_warm, market, ip_address, \
     current_execution_id, created_at, last_used_at, terminating_since";

const EXECUTION_COLUMNS: &str = "execution_id, workload_id, credential_ref, credential_provider, \
     work_spec, status, progress, current_step, total_steps, instance_id, created_at, \
     started_at, completed_at";

#[derive(sqlx::FromRow)]
struct InstanceRow {
    instance_id: String,
    status: String,
    is_warm: bool,
    market: String,
    ip_address: Option<String>,
    current_execution_id: Option<String>,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    terminating_since: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for InstanceRecord {
    type Error = CoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            instance_id: row.instance_id,
            status: row.status.parse()?,
            is_warm: row.is_warm,
            market: row.market.parse()?,
            ip_address: row.ip_address,
            current_execution_id: row.current_execution_id,
            created_at: row.created_at,
            last_used_at: row.last_used_at,
            terminating_since: row.terminating_since,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    execution_id: String,
    workload_id: String,
    credential_ref: String,
    credential_provider: String,
    work_spec: String,
    status: String,
    progress: Option<String>,
    current_step: i32,
    total_steps: i32,
    instance_id: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExecutionRow> for ExecutionRecord {
    type Error = CoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let work_spec = serde_json::from_str(&row.work_spec).map_err(|e| {
            CoreError::InvalidRecord {
                entity: "execution",
                details: format!("work_spec is not valid JSON: {}", e),
            }
        })?;
        Ok(Self {
            execution_id: row.execution_id,
            workload_id: row.workload_id,
            credential_ref: row.credential_ref,
            credential_provider: row.credential_provider,
            work_spec,
            status: row.status.parse()?,
            progress: row.progress,
            current_step: row.current_step,
            total_steps: row.total_steps,
            instance_id: row.instance_id,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Registry stored in a SQLite database.
#[derive(Clone)]
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    /// Wrap an existing pool. The schema must already be migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        MIGRATOR.run(&pool).await?;
        info!(url = %url, "SQLite registry ready");
        Ok(Self { pool })
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// Parent directories are created when missing.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn push_instance_filter<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filter: &'a InstanceFilter) {
    builder.push(" WHERE 1 = 1");
    if !filter.statuses.is_empty() {
        builder.push(" AND status IN (");
        let mut separated = builder.separated(", ");
        for status in &filter.statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
    }
    if let Some(is_warm) = filter.is_warm {
        builder.push(" AND is_warm = ").push_bind(is_warm);
    }
}

#[async_trait::async_trait]
impl InstanceStore for SqliteRegistry {
    async fn insert_instance(&self, record: &InstanceRecord) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO instances (instance_id, status, is_warm, market, ip_address,
                                   current_execution_id, created_at, last_used_at, terminating_since)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.instance_id)
        .bind(record.status.as_str())
        .bind(record.is_warm)
        .bind(record.market.as_str())
        .bind(&record.ip_address)
        .bind(&record.current_execution_id)
        .bind(record.created_at)
        .bind(record.last_used_at)
        .bind(record.terminating_since)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(CoreError::InstanceAlreadyExists {
                instance_id: record.instance_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {} FROM instances WHERE instance_id = ?",
            INSTANCE_COLUMNS
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(InstanceRecord::try_from).transpose()
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM instances",
            INSTANCE_COLUMNS
        ));
        push_instance_filter(&mut builder, filter);
        builder.push(" ORDER BY last_used_at ASC, created_at ASC, instance_id ASC");

        let rows = builder
            .build_query_as::<InstanceRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(InstanceRecord::try_from).collect()
    }

    async fn count_instances(&self, filter: &InstanceFilter) -> Result<i64, CoreError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM instances");
        push_instance_filter(&mut builder, filter);

        let (count,): (i64,) = builder.build_query_as().fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn claim_available_instance(
        &self,
        warm: bool,
        execution_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<InstanceRecord>, CoreError> {
        // Select and update in one statement so concurrent claimers serialize
        // on the write and never observe the same candidate as available.
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            r#"
            UPDATE instances
            SET status = 'busy', is_warm = 0, current_execution_id = ?, last_used_at = ?
            WHERE instance_id = (
                SELECT instance_id FROM instances
                WHERE status = 'available' AND is_warm = ?
                ORDER BY last_used_at ASC, created_at ASC, instance_id ASC
                LIMIT 1
            )
            AND status = 'available'
            RETURNING {}
            "#,
            INSTANCE_COLUMNS
        ))
        .bind(execution_id)
        .bind(now)
        .bind(warm)
        .fetch_optional(&self.pool)
        .await?;

        row.map(InstanceRecord::try_from).transpose()
    }

    async fn mark_instance_ready(
        &self,
        instance_id: &str,
        ip_address: Option<&str>,
        assign_to: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = match assign_to {
            Some(execution_id) => {
                sqlx::query(
                    r#"
                    UPDATE instances
                    SET status = 'busy', is_warm = 0, ip_address = ?,
                        current_execution_id = ?, last_used_at = ?
                    WHERE instance_id = ? AND status = 'launching'
                    "#,
                )
                .bind(ip_address)
                .bind(execution_id)
                .bind(now)
                .bind(instance_id)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE instances
                    SET status = 'available', ip_address = ?, current_execution_id = NULL,
                        last_used_at = ?
                    WHERE instance_id = ? AND status = 'launching'
                    "#,
                )
                .bind(ip_address)
                .bind(now)
                .bind(instance_id)
                .execute(&self.pool)
                .await?
            }
        };

        let applied = result.rows_affected() > 0;
        if !applied {
            debug!(instance_id = %instance_id, "Instance not launching, ready transition skipped");
        }
        Ok(applied)
    }

    async fn release_instance(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET status = 'available', current_execution_id = NULL, last_used_at = ?
            WHERE instance_id = ? AND status IN (?, ?)
            "#,
        )
        .bind(now)
        .bind(instance_id)
        .bind(RELEASABLE[0].as_str())
        .bind(RELEASABLE[1].as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_instance_terminating(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET status = 'terminating', is_warm = 0, terminating_since = ?
            WHERE instance_id = ? AND status != 'terminating'
            "#,
        )
        .bind(now)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn retire_warm_instance(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET status = 'terminating', is_warm = 0, terminating_since = ?
            WHERE instance_id = ? AND status = 'available' AND is_warm = 1
            "#,
        )
        .bind(now)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM instances WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_terminated_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, CoreError> {
        let ids: Vec<(String,)> = sqlx::query_as(
            r#"
            DELETE FROM instances
            WHERE status = 'terminating' AND terminating_since < ?
            RETURNING instance_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait::async_trait]
impl ExecutionStore for SqliteRegistry {
    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<(), CoreError> {
        let work_spec = serde_json::to_string(&record.work_spec)?;
        let result = sqlx::query(
            r#"
            INSERT INTO executions (execution_id, workload_id, credential_ref, credential_provider,
                                    work_spec, status, progress, current_step, total_steps,
                                    instance_id, created_at, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.execution_id)
        .bind(&record.workload_id)
        .bind(&record.credential_ref)
        .bind(&record.credential_provider)
        .bind(work_spec)
        .bind(record.status.as_str())
        .bind(&record.progress)
        .bind(record.current_step)
        .bind(record.total_steps)
        .bind(&record.instance_id)
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(CoreError::ExecutionAlreadyExists {
                execution_id: record.execution_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, CoreError> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {} FROM executions WHERE execution_id = ?",
            EXECUTION_COLUMNS
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ExecutionRecord::try_from).transpose()
    }

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionRecord>, CoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, ExecutionRow>(&format!(
                    "SELECT {} FROM executions WHERE status = ? \
                     ORDER BY created_at ASC, execution_id ASC",
                    EXECUTION_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ExecutionRow>(&format!(
                    "SELECT {} FROM executions ORDER BY created_at ASC, execution_id ASC",
                    EXECUTION_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(ExecutionRecord::try_from).collect()
    }

    async fn start_execution_if_queued(
        &self,
        execution_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'running', started_at = ?
            WHERE execution_id = ? AND status = 'queued'
            "#,
        )
        .bind(started_at)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            debug!(execution_id = %execution_id, "Execution not queued, start skipped");
        }
        Ok(applied)
    }

    async fn assign_execution_instance(
        &self,
        execution_id: &str,
        instance_id: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET instance_id = ?
            WHERE execution_id = ? AND status = 'running'
            "#,
        )
        .bind(instance_id)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            debug!(execution_id = %execution_id, "Execution not running, assignment skipped");
        }
        Ok(applied)
    }

    async fn update_progress_if_running(
        &self,
        execution_id: &str,
        progress: &str,
        current_step: i32,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET progress = ?, current_step = ?
            WHERE execution_id = ? AND status = 'running'
            "#,
        )
        .bind(progress)
        .bind(current_step)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
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

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, progress = ?, current_step = COALESCE(?, current_step),
                completed_at = ?
            WHERE execution_id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(progress)
        .bind(current_step)
        .bind(completed_at)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            debug!(execution_id = %execution_id, "Execution not running, terminal write skipped");
        }
        Ok(applied)
    }
}
