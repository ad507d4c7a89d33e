//! PostgreSQL task store.
//!
//! One row per task with the envelope in a JSONB `document`. Work-state writes
//! touch only the node's subtree through `jsonb_set`, conditioned on the row
//! version like every other write.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{StoreError, StoreResult, TaskStore};
use crate::config::DatabaseConfig;
use crate::models::{ActivityPath, ActivityWorkState, TaskEnvelope};
use crate::state_machine::TaskLifecycleState;

const SCHEMA_SQL: &str = include_str!("../../migrations/20261019000000_create_activity_tasks.sql");

#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using `database.url` (or `DATABASE_URL`)
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let url = config.database_url().ok_or_else(|| {
            StoreError::Unavailable("no database url configured".to_string())
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&url)
            .await
            .map_err(map_sqlx_error)?;

        info!(
            max_connections = config.max_connections,
            "Activity task store connected"
        );
        Ok(Self { pool })
    }

    /// Create the table and indexes if they do not exist
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Distinguish a lost race from a missing row after a conditional write matched nothing
    async fn conflict_or_missing(&self, task_id: Uuid, expected_version: i64) -> StoreError {
        let current = sqlx::query(
            "SELECT version FROM activity_tasks WHERE task_id = $1 AND archived_at IS NULL",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await;

        match current {
            Ok(Some(row)) => match row.try_get::<i64, _>("version") {
                Ok(actual) => StoreError::VersionConflict {
                    task_id,
                    expected: expected_version,
                    actual,
                },
                Err(e) => map_sqlx_error(e),
            },
            Ok(None) => StoreError::NotFound(task_id),
            Err(e) => map_sqlx_error(e),
        }
    }
}

/// `{root_activity,children,1,children,0,work_state}` for the node at `indices`
pub(crate) fn work_state_json_path(child_indices: &[usize]) -> Vec<String> {
    let mut path = vec!["root_activity".to_string()];
    for index in child_indices {
        path.push("children".to_string());
        path.push(index.to_string());
    }
    path.push("work_state".to_string());
    path
}

fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(error.to_string())
        }
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            StoreError::Serialization(error.to_string())
        }
        other => StoreError::Database(other.to_string()),
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> StoreResult<TaskEnvelope> {
    let Json(mut task): Json<TaskEnvelope> = row.try_get("document").map_err(map_sqlx_error)?;
    task.version = row.try_get("version").map_err(map_sqlx_error)?;
    Ok(task)
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert_task(&self, task: &TaskEnvelope) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO activity_tasks
                (task_id, name, lifecycle_state, execution_node_id, version, document, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(task.task_id)
        .bind(&task.name)
        .bind(task.lifecycle_state.to_string())
        .bind(task.execution_node_id.as_deref())
        .bind(task.version)
        .bind(Json(task))
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(task.task_id));
        }
        debug!(task_id = %task.task_id, "Inserted task");
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> StoreResult<Option<TaskEnvelope>> {
        let row = sqlx::query(
            "SELECT document, version FROM activity_tasks WHERE task_id = $1 AND archived_at IS NULL",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn update_task(&self, task: &TaskEnvelope, expected_version: i64) -> StoreResult<i64> {
        let row = sqlx::query(
            r#"
            UPDATE activity_tasks
            SET document = $2,
                name = $3,
                lifecycle_state = $4,
                execution_node_id = $5,
                version = version + 1,
                updated_at = now()
            WHERE task_id = $1 AND version = $6 AND archived_at IS NULL
            RETURNING version
            "#,
        )
        .bind(task.task_id)
        .bind(Json(task))
        .bind(&task.name)
        .bind(task.lifecycle_state.to_string())
        .bind(task.execution_node_id.as_deref())
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => row.try_get("version").map_err(map_sqlx_error),
            None => Err(self.conflict_or_missing(task.task_id, expected_version).await),
        }
    }

    async fn update_work_state(
        &self,
        task_id: Uuid,
        path: &ActivityPath,
        work_state: &ActivityWorkState,
        expected_version: i64,
    ) -> StoreResult<i64> {
        // Resolve identifiers to positions against the current document
        let current = self
            .get_task(task_id)
            .await?
            .ok_or(StoreError::NotFound(task_id))?;
        let indices = current
            .root_activity
            .child_indices(path)
            .ok_or_else(|| StoreError::ActivityNotFound {
                task_id,
                path: path.to_string(),
            })?;

        let row = sqlx::query(
            r#"
            UPDATE activity_tasks
            SET document = jsonb_set(document, $2::text[], $3::jsonb, false),
                version = version + 1,
                updated_at = now()
            WHERE task_id = $1 AND version = $4 AND archived_at IS NULL
            RETURNING version
            "#,
        )
        .bind(task_id)
        .bind(work_state_json_path(&indices))
        .bind(Json(work_state))
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => row.try_get("version").map_err(map_sqlx_error),
            None => Err(self.conflict_or_missing(task_id, expected_version).await),
        }
    }

    async fn list_tasks(&self, states: &[TaskLifecycleState]) -> StoreResult<Vec<TaskEnvelope>> {
        let states: Vec<String> = states.iter().map(ToString::to_string).collect();
        let rows = sqlx::query(
            r#"
            SELECT document, version FROM activity_tasks
            WHERE lifecycle_state = ANY($1) AND archived_at IS NULL
            ORDER BY created_at
            "#,
        )
        .bind(states)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(decode_row).collect()
    }

    async fn archive_task(&self, task_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE activity_tasks SET archived_at = now() WHERE task_id = $1 AND archived_at IS NULL",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }
}
