//! # Persistence
//!
//! The [`TaskStore`] trait is the only cross-node synchronization point: every
//! write is conditioned on the record version read beforehand. Bucket claims,
//! completions and lifecycle transitions are all read-modify-write cycles retried
//! on [`StoreError::VersionConflict`].

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{ActivityPath, ActivityWorkState, TaskEnvelope};
use crate::state_machine::TaskLifecycleState;

pub use in_memory::InMemoryTaskStore;
pub use postgres::PgTaskStore;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Task {0} not found")]
    NotFound(Uuid),
    #[error("Task {0} already exists")]
    AlreadyExists(Uuid),
    #[error("Version conflict on task {task_id}: expected {expected}, found {actual}")]
    VersionConflict {
        task_id: Uuid,
        expected: i64,
        actual: i64,
    },
    #[error("Activity {path} not found in task {task_id}")]
    ActivityNotFound { task_id: Uuid, path: String },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::VersionConflict { .. }
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence boundary for task envelopes
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &TaskEnvelope) -> StoreResult<()>;

    /// Current envelope with its `version` filled in; `None` if absent or archived
    async fn get_task(&self, task_id: Uuid) -> StoreResult<Option<TaskEnvelope>>;

    /// Replace the whole envelope if the stored version equals `expected_version`.
    /// Returns the new version.
    async fn update_task(&self, task: &TaskEnvelope, expected_version: i64) -> StoreResult<i64>;

    /// Replace one node's work state if the stored version equals `expected_version`.
    /// Returns the new version.
    async fn update_work_state(
        &self,
        task_id: Uuid,
        path: &ActivityPath,
        work_state: &ActivityWorkState,
        expected_version: i64,
    ) -> StoreResult<i64>;

    async fn list_tasks(&self, states: &[TaskLifecycleState]) -> StoreResult<Vec<TaskEnvelope>>;

    /// Remove from all queries; returns whether a live record was archived
    async fn archive_task(&self, task_id: Uuid) -> StoreResult<bool>;
}

/// Read-modify-write of a whole envelope, retried on version conflicts.
///
/// `modify` runs against a fresh copy on every attempt and may abort the cycle by
/// returning an error. Returns the persisted envelope (with its new version) and
/// whatever `modify` produced.
pub async fn modify_task<T, F>(
    store: &dyn TaskStore,
    task_id: Uuid,
    max_attempts: u32,
    mut modify: F,
) -> EngineResult<(TaskEnvelope, T)>
where
    F: FnMut(&mut TaskEnvelope) -> EngineResult<T>,
{
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        let mut task = store
            .get_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        let expected_version = task.version;
        let output = modify(&mut task)?;

        match store.update_task(&task, expected_version).await {
            Ok(new_version) => {
                task.version = new_version;
                return Ok((task, output));
            }
            Err(error) if error.is_conflict() => {
                debug!(task_id = %task_id, attempt = attempt, "Task write conflicted, retrying");
            }
            Err(error) => return Err(error.into()),
        }
    }

    Err(EngineError::Persistence(StoreError::Unavailable(format!(
        "task {task_id} kept changing concurrently after {attempts} attempts"
    ))))
}

/// Read-modify-write of one node's work state, retried on version conflicts.
pub async fn modify_work_state<T, F>(
    store: &dyn TaskStore,
    task_id: Uuid,
    path: &ActivityPath,
    max_attempts: u32,
    mut modify: F,
) -> EngineResult<(ActivityWorkState, T)>
where
    F: FnMut(&mut ActivityWorkState) -> EngineResult<T>,
{
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        let task = store
            .get_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        let mut work_state = task
            .activity(path)
            .ok_or_else(|| EngineError::ActivityNotFound {
                task_id,
                path: path.to_string(),
            })?
            .work_state
            .clone();
        let output = modify(&mut work_state)?;

        match store
            .update_work_state(task_id, path, &work_state, task.version)
            .await
        {
            Ok(_) => return Ok((work_state, output)),
            Err(error) if error.is_conflict() => {
                debug!(
                    task_id = %task_id,
                    activity_path = %path,
                    attempt = attempt,
                    "Work state write conflicted, retrying"
                );
            }
            Err(error) => return Err(error.into()),
        }
    }

    Err(EngineError::Persistence(StoreError::Unavailable(format!(
        "activity {path} of task {task_id} kept changing concurrently after {attempts} attempts"
    ))))
}
