//! In-process task store.
//!
//! Each record sits behind its dashmap shard lock, so the compare-and-write of a
//! conditional update is atomic. Fault injection hooks let tests provoke version
//! conflicts and outages deterministically.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use uuid::Uuid;

use super::{StoreError, StoreResult, TaskStore};
use crate::models::{ActivityPath, ActivityWorkState, TaskEnvelope};
use crate::state_machine::TaskLifecycleState;

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<Uuid, TaskEnvelope>,
    archived: Mutex<Vec<TaskEnvelope>>,
    injected_conflicts: AtomicU32,
    unavailable: AtomicBool,
    successful_writes: AtomicU64,
    rejected_writes: AtomicU64,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` conditional writes fail as if another node wrote first
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.fetch_add(count, Ordering::SeqCst);
    }

    /// Simulate an outage: every call fails with `Unavailable` until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn successful_writes(&self) -> u64 {
        self.successful_writes.load(Ordering::SeqCst)
    }

    /// Conditional writes rejected with a version conflict (injected or real)
    pub fn rejected_writes(&self) -> u64 {
        self.rejected_writes.load(Ordering::SeqCst)
    }

    pub fn archived_count(&self) -> usize {
        self.archived.lock().len()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }

    /// Shared version check for both conditional writes; holds the record's shard lock
    fn conditional_write<F>(&self, task_id: Uuid, expected_version: i64, write: F) -> StoreResult<i64>
    where
        F: FnOnce(&mut TaskEnvelope) -> StoreResult<()>,
    {
        self.check_available()?;
        let mut entry = self
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;

        if self.take_injected_conflict() {
            // a competing writer got there first
            entry.version += 1;
        }

        if entry.version != expected_version {
            self.rejected_writes.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::VersionConflict {
                task_id,
                expected: expected_version,
                actual: entry.version,
            });
        }

        write(entry.value_mut())?;
        entry.version = expected_version + 1;
        entry.updated_at = Utc::now();
        self.successful_writes.fetch_add(1, Ordering::SeqCst);
        Ok(entry.version)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_task(&self, task: &TaskEnvelope) -> StoreResult<()> {
        self.check_available()?;
        match self.tasks.entry(task.task_id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(task.task_id)),
            Entry::Vacant(slot) => {
                slot.insert(task.clone());
                Ok(())
            }
        }
    }

    async fn get_task(&self, task_id: Uuid) -> StoreResult<Option<TaskEnvelope>> {
        self.check_available()?;
        Ok(self.tasks.get(&task_id).map(|entry| entry.value().clone()))
    }

    async fn update_task(&self, task: &TaskEnvelope, expected_version: i64) -> StoreResult<i64> {
        self.conditional_write(task.task_id, expected_version, |stored| {
            *stored = task.clone();
            Ok(())
        })
    }

    async fn update_work_state(
        &self,
        task_id: Uuid,
        path: &ActivityPath,
        work_state: &ActivityWorkState,
        expected_version: i64,
    ) -> StoreResult<i64> {
        self.conditional_write(task_id, expected_version, |stored| {
            let node = stored
                .activity_mut(path)
                .ok_or_else(|| StoreError::ActivityNotFound {
                    task_id,
                    path: path.to_string(),
                })?;
            node.work_state = work_state.clone();
            Ok(())
        })
    }

    async fn list_tasks(&self, states: &[TaskLifecycleState]) -> StoreResult<Vec<TaskEnvelope>> {
        self.check_available()?;
        let mut tasks: Vec<TaskEnvelope> = self
            .tasks
            .iter()
            .filter(|entry| states.contains(&entry.lifecycle_state))
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        Ok(tasks)
    }

    async fn archive_task(&self, task_id: Uuid) -> StoreResult<bool> {
        self.check_available()?;
        match self.tasks.remove(&task_id) {
            Some((_, task)) => {
                self.archived.lock().push(task);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
