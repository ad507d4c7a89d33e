//! # Task Manager
//!
//! The lifecycle control surface: submission, operator controls, progress and
//! the per-node scheduling loop.
//!
//! ## Architecture: Claim, Drive, Settle
//!
//! A node claims a RUNNABLE task with a version-conditioned write
//! (`RUNNABLE -> RUNNING`, owner recorded), drives the root activity through the
//! [`ActivityExecutor`] and settles the envelope from the run's outcome:
//!
//! | activity outcome | task transition                                    |
//! |------------------|----------------------------------------------------|
//! | completed        | CLOSED (success / partial error), or WAITING if recurring |
//! | failed           | CLOSED with `FatalError`                           |
//! | suspended        | SUSPENDED, CLOSED (cancel request) or RUNNABLE (shutdown) |
//! | deferred         | SUSPENDED with `auto_resume_at`, result `Deferred` |
//!
//! Operator requests against a task running on some node are persisted as a
//! control request and picked up by the owner between buckets; a local run is
//! also interrupted through its cancellation token.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use activity_engine::config::ActivityEngineConfig;
//! use activity_engine::models::{ActivityNode, ObjectFilter, Schedule, WorkDefinition};
//! use activity_engine::orchestration::TaskManager;
//! use activity_engine::persistence::InMemoryTaskStore;
//! use activity_engine::registry::HandlerRegistry;
//! use activity_engine::source::InMemoryObjectSource;
//! use std::sync::Arc;
//!
//! # async fn example(registry: HandlerRegistry) -> Result<(), Box<dyn std::error::Error>> {
//! let manager = TaskManager::new(
//!     ActivityEngineConfig::default(),
//!     Arc::new(InMemoryTaskStore::new()),
//!     Arc::new(InMemoryObjectSource::new()),
//!     registry,
//! )?;
//!
//! let root = ActivityNode::leaf("recompute", WorkDefinition::query("user", ObjectFilter::All, "recompute"));
//! let task_id = manager.submit("nightly recompute", root, Schedule::once()).await?;
//! let outcome = manager.run_task(task_id).await?;
//! println!("{task_id}: {outcome:?}");
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::activity_executor::{ActivityExecutor, ActivityRunOutcome};
use crate::buckets::{ClaimReaper, HeartbeatRegistry};
use crate::config::ActivityEngineConfig;
use crate::constants::{defaults, events};
use crate::error::{EngineError, EngineResult};
use crate::events::EventPublisher;
use crate::logging::{log_error, log_task_operation};
use crate::models::{ActivityNode, ActivityPath, ControlRequest, Schedule, TaskEnvelope, TaskResultStatus};
use crate::persistence::{modify_task, TaskStore};
use crate::registry::HandlerRegistry;
use crate::source::ObjectSource;
use crate::state_machine::{
    ActivityEvent, ActivityState, ActivityStateMachine, StateMachineResult, TaskEvent,
    TaskLifecycleState, TaskStateMachine,
};
use crate::statistics::{LiveProgress, ProgressSnapshot};
use crate::validation::validate_activity_tree;

/// How one run of a task on this node ended
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRunOutcome {
    /// Closed after the root activity completed
    Completed(TaskResultStatus),
    /// Recurring task parked until its next run
    Rescheduled(DateTime<Utc>),
    /// Closed with a fatal error
    Failed(String),
    /// Suspended by an operator request
    Suspended,
    /// Self-suspended after a transient infrastructure error
    Deferred(DateTime<Utc>),
    Cancelled,
    /// Given back as RUNNABLE, or taken over by another node
    Released,
}

impl TaskRunOutcome {
    fn event_name(&self) -> Option<&'static str> {
        match self {
            TaskRunOutcome::Completed(_) => Some(events::TASK_COMPLETED),
            TaskRunOutcome::Rescheduled(_) => Some(events::TASK_RESCHEDULED),
            TaskRunOutcome::Failed(_) => Some(events::TASK_FAILED),
            TaskRunOutcome::Suspended | TaskRunOutcome::Deferred(_) => Some(events::TASK_SUSPENDED),
            TaskRunOutcome::Cancelled => Some(events::TASK_CANCELLED),
            TaskRunOutcome::Released => None,
        }
    }
}

pub struct TaskManager {
    config: ActivityEngineConfig,
    store: Arc<dyn TaskStore>,
    executor: ActivityExecutor,
    registry: Arc<HandlerRegistry>,
    publisher: EventPublisher,
    live: Arc<LiveProgress>,
    /// Cancellation tokens of runs driven by this node
    running: DashMap<Uuid, CancellationToken>,
    reaper: Option<Arc<ClaimReaper>>,
    heartbeats: Option<Arc<HeartbeatRegistry>>,
    max_concurrent_tasks: usize,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("node_id", &self.node_id())
            .field("running", &self.running.len())
            .field("reaper", &self.reaper.is_some())
            .field("max_concurrent_tasks", &self.max_concurrent_tasks)
            .finish()
    }
}

impl TaskManager {
    pub fn new(
        config: ActivityEngineConfig,
        store: Arc<dyn TaskStore>,
        source: Arc<dyn ObjectSource>,
        registry: HandlerRegistry,
    ) -> EngineResult<Self> {
        config.validate()?;

        let registry = Arc::new(registry);
        let publisher = EventPublisher::default();
        let live = Arc::new(LiveProgress::new());
        let executor = ActivityExecutor::new(
            &config,
            store.clone(),
            source,
            registry.clone(),
            publisher.clone(),
            live.clone(),
        );

        info!(
            node_id = %config.engine.node_id,
            handlers = registry.len(),
            "Task manager initialized"
        );

        Ok(Self {
            config,
            store,
            executor,
            registry,
            publisher,
            live,
            running: DashMap::new(),
            reaper: None,
            heartbeats: None,
            max_concurrent_tasks: defaults::MAX_CONCURRENT_TASKS,
        })
    }

    /// Run a reaping pass before every scheduling pass
    pub fn with_reaper(mut self, reaper: Arc<ClaimReaper>) -> Self {
        self.reaper = Some(reaper);
        self
    }

    /// Record a heartbeat for this node on every scheduling pass and while a
    /// task is being driven
    pub fn with_heartbeats(mut self, heartbeats: Arc<HeartbeatRegistry>) -> Self {
        self.heartbeats = Some(heartbeats);
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max_concurrent_tasks: usize) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks.max(1);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.config.engine.node_id
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn executor(&self) -> &ActivityExecutor {
        &self.executor
    }

    pub fn is_running_locally(&self, task_id: Uuid) -> bool {
        self.running.contains_key(&task_id)
    }

    /// Validate and persist a new task; RUNNABLE, or WAITING until `not_before`
    #[instrument(skip(self, root, schedule), fields(node_id = %self.node_id()))]
    pub async fn submit(
        &self,
        name: &str,
        root: ActivityNode,
        schedule: Schedule,
    ) -> EngineResult<Uuid> {
        validate_activity_tree(&root, &self.registry)?;

        let mut root = root;
        root.reset_tree();
        let task = TaskEnvelope::new(name, root, schedule);
        self.store.insert_task(&task).await?;

        log_task_operation(
            "submit",
            task.task_id,
            Some(name),
            &task.lifecycle_state.to_string(),
            None,
        );
        self.publisher.publish_task(
            events::TASK_SUBMITTED,
            task.task_id,
            json!({ "name": name, "lifecycle_state": task.lifecycle_state }),
        );
        Ok(task.task_id)
    }

    /// Suspend a task. A run in progress stops after its in-flight bucket.
    #[instrument(skip(self))]
    pub async fn suspend(&self, task_id: Uuid) -> EngineResult<()> {
        let (task, running) = modify_task(
            self.store.as_ref(),
            task_id,
            self.config.engine.max_claim_attempts,
            |task| match task.lifecycle_state {
                TaskLifecycleState::Running => {
                    if task.control_request.is_none() {
                        task.control_request = Some(ControlRequest::Suspend);
                    }
                    Ok(true)
                }
                TaskLifecycleState::Runnable | TaskLifecycleState::Waiting => {
                    suspend_in_progress_activities(task)?;
                    TaskStateMachine::transition(task, TaskEvent::Suspend)?;
                    Ok(false)
                }
                // an operator suspension overrides a pending automatic resume
                TaskLifecycleState::Suspended => {
                    task.auto_resume_at = None;
                    Ok(false)
                }
                TaskLifecycleState::Closed => Err(EngineError::InvalidState(format!(
                    "task {task_id} is closed and cannot be suspended"
                ))),
            },
        )
        .await?;

        if running {
            self.interrupt_local_run(task_id);
        } else {
            self.publisher
                .publish_task(events::TASK_SUSPENDED, task_id, json!({ "requested": true }));
        }
        log_task_operation(
            "suspend",
            task_id,
            Some(&task.name),
            &task.lifecycle_state.to_string(),
            running.then_some("suspend requested from owning node"),
        );
        Ok(())
    }

    /// Make a suspended task RUNNABLE again, or withdraw a pending suspend request
    #[instrument(skip(self))]
    pub async fn resume(&self, task_id: Uuid) -> EngineResult<()> {
        let (task, _) = modify_task(
            self.store.as_ref(),
            task_id,
            self.config.engine.max_claim_attempts,
            |task| match (task.lifecycle_state, task.control_request) {
                (TaskLifecycleState::Suspended, _) => {
                    TaskStateMachine::transition(task, TaskEvent::Resume)?;
                    Ok(())
                }
                (TaskLifecycleState::Running, Some(ControlRequest::Suspend)) => {
                    task.control_request = None;
                    Ok(())
                }
                (state, _) => Err(EngineError::InvalidState(format!(
                    "task {task_id} is {state} and cannot be resumed"
                ))),
            },
        )
        .await?;

        log_task_operation(
            "resume",
            task_id,
            Some(&task.name),
            &task.lifecycle_state.to_string(),
            None,
        );
        self.publisher.publish_task(events::TASK_RESUMED, task_id, json!({}));
        Ok(())
    }

    /// Close a task as cancelled. A running task is cancelled by its owner
    /// once the in-flight bucket has drained.
    #[instrument(skip(self))]
    pub async fn cancel(&self, task_id: Uuid) -> EngineResult<()> {
        let (task, running) = modify_task(
            self.store.as_ref(),
            task_id,
            self.config.engine.max_claim_attempts,
            |task| match task.lifecycle_state {
                TaskLifecycleState::Running => {
                    task.control_request = Some(ControlRequest::Cancel);
                    Ok(true)
                }
                TaskLifecycleState::Closed => Err(EngineError::InvalidState(format!(
                    "task {task_id} is already closed"
                ))),
                _ => {
                    suspend_in_progress_activities(task)?;
                    TaskStateMachine::transition(task, TaskEvent::Cancel)?;
                    Ok(false)
                }
            },
        )
        .await?;

        if running {
            self.interrupt_local_run(task_id);
        } else {
            self.publisher.publish_task(events::TASK_CANCELLED, task_id, json!({}));
        }
        log_task_operation(
            "cancel",
            task_id,
            Some(&task.name),
            &task.lifecycle_state.to_string(),
            running.then_some("cancel requested from owning node"),
        );
        Ok(())
    }

    pub async fn get_progress(&self, task_id: Uuid) -> EngineResult<ProgressSnapshot> {
        let task = self.load_task(task_id).await?;
        Ok(ProgressSnapshot::from_task(
            &task,
            &self.live,
            self.config.worker_pool.recent_failure_limit,
        ))
    }

    /// Archive a task that is not running
    #[instrument(skip(self))]
    pub async fn delete(&self, task_id: Uuid) -> EngineResult<()> {
        let task = self.load_task(task_id).await?;
        if task.lifecycle_state == TaskLifecycleState::Running {
            return Err(EngineError::InvalidState(format!(
                "task {task_id} is running on {}; cancel or suspend it first",
                task.execution_node_id.as_deref().unwrap_or("an unknown node")
            )));
        }

        if !self.store.archive_task(task_id).await? {
            return Err(EngineError::TaskNotFound(task_id));
        }
        log_task_operation("delete", task_id, Some(&task.name), "archived", None);
        self.publisher.publish_task(events::TASK_DELETED, task_id, json!({}));
        Ok(())
    }

    /// Claim a RUNNABLE task (or reclaim one this node owned before a restart)
    /// and drive it to its next resting state.
    #[instrument(skip(self), fields(node_id = %self.node_id()))]
    pub async fn run_task(&self, task_id: Uuid) -> EngineResult<TaskRunOutcome> {
        let task = self.load_task(task_id).await?;
        let reclaim = task.is_owned_by(self.node_id()) && !self.is_running_locally(task_id);

        if !reclaim {
            if task.lifecycle_state != TaskLifecycleState::Runnable {
                return Err(EngineError::InvalidState(format!(
                    "task {task_id} is {} and cannot be run",
                    task.lifecycle_state
                )));
            }
            if !self.claim(task_id).await? {
                return Err(EngineError::InvalidState(format!(
                    "task {task_id} was claimed by another node"
                )));
            }
        }

        self.drive(task_id).await
    }

    /// One scheduling pass: reap stale claims, wake due WAITING tasks, resume due
    /// self-suspended tasks, then claim and run up to `limit` tasks concurrently.
    pub async fn run_ready_tasks(&self, limit: usize) -> EngineResult<Vec<(Uuid, EngineResult<TaskRunOutcome>)>> {
        let claimed = self.claim_ready_tasks(limit).await?;
        let outcomes = join_all(claimed.iter().map(|task_id| self.drive(*task_id))).await;
        Ok(claimed.into_iter().zip(outcomes).collect())
    }

    /// Poll for work until `cancel` fires, running claimed tasks in the background.
    ///
    /// On shutdown local runs are interrupted and their tasks handed back as
    /// RUNNABLE for other nodes.
    pub async fn run_scheduler(self: Arc<Self>, cancel: CancellationToken) -> EngineResult<()> {
        info!(node_id = %self.node_id(), "Scheduler started");
        let poll_interval = self.config.engine.poll_interval();
        let mut runs: JoinSet<(Uuid, EngineResult<TaskRunOutcome>)> = JoinSet::new();

        loop {
            let capacity = self.max_concurrent_tasks.saturating_sub(runs.len());
            if capacity > 0 {
                match self.claim_ready_tasks(capacity).await {
                    Ok(claimed) => {
                        for task_id in claimed {
                            let manager = self.clone();
                            runs.spawn(async move {
                                let outcome = manager.drive(task_id).await;
                                (task_id, outcome)
                            });
                        }
                    }
                    Err(error) => {
                        warn!(node_id = %self.node_id(), error = %error, "Scheduling pass failed");
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = runs.join_next(), if !runs.is_empty() => log_run(joined),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        for entry in self.running.iter() {
            entry.value().cancel();
        }
        while let Some(joined) = runs.join_next().await {
            log_run(joined);
        }
        info!(node_id = %self.node_id(), "Scheduler stopped");
        Ok(())
    }

    /// Process buckets of an activity driven by another node
    pub async fn join_activity(
        &self,
        task_id: Uuid,
        path: &ActivityPath,
        cancel: &CancellationToken,
    ) -> EngineResult<u64> {
        self.executor.join_activity(task_id, path, cancel).await
    }

    async fn claim_ready_tasks(&self, limit: usize) -> EngineResult<Vec<Uuid>> {
        if let Some(heartbeats) = &self.heartbeats {
            heartbeats.beat(self.node_id());
        }
        if let Some(reaper) = &self.reaper {
            match reaper.reap().await {
                Ok(report) if report.buckets_released > 0 || report.tasks_recovered > 0 => {
                    info!(
                        buckets_released = report.buckets_released,
                        tasks_recovered = report.tasks_recovered,
                        "Reaped stale claims"
                    );
                }
                Ok(_) => {}
                Err(error) => warn!(error = %error, "Claim reaping failed"),
            }
        }

        let now = Utc::now();
        for task in self.store.list_tasks(&[TaskLifecycleState::Waiting]).await? {
            if task.is_due(now)
                && self
                    .transition_if(task.task_id, TaskEvent::Wake, |t| t.is_due(now))
                    .await?
            {
                debug!(task_id = %task.task_id, "Waiting task is due");
            }
        }
        for task in self.store.list_tasks(&[TaskLifecycleState::Suspended]).await? {
            if task.is_auto_resume_due(now)
                && self
                    .transition_if(task.task_id, TaskEvent::Resume, |t| t.is_auto_resume_due(now))
                    .await?
            {
                log_task_operation("auto_resume", task.task_id, Some(&task.name), "runnable", None);
                self.publisher
                    .publish_task(events::TASK_RESUMED, task.task_id, json!({ "automatic": true }));
            }
        }

        let mut claimed = Vec::new();
        let mut owned = self.store.list_tasks(&[TaskLifecycleState::Running]).await?;
        owned.retain(|task| task.is_owned_by(self.node_id()) && !self.is_running_locally(task.task_id));
        owned.sort_by_key(|task| task.created_at);
        claimed.extend(owned.into_iter().take(limit).map(|task| task.task_id));

        let mut runnable = self.store.list_tasks(&[TaskLifecycleState::Runnable]).await?;
        runnable.sort_by_key(|task| task.created_at);
        for task in runnable {
            if claimed.len() >= limit {
                break;
            }
            if self.claim(task.task_id).await? {
                claimed.push(task.task_id);
            }
        }
        Ok(claimed)
    }

    async fn claim(&self, task_id: Uuid) -> EngineResult<bool> {
        let node_id = self.node_id().to_string();
        let claimed = self
            .transition_if(task_id, TaskEvent::Claim(node_id), |task| {
                task.lifecycle_state == TaskLifecycleState::Runnable
            })
            .await?;
        if claimed {
            log_task_operation("claim", task_id, None, "running", Some(self.node_id()));
            self.publisher.publish_task(
                events::TASK_STARTED,
                task_id,
                json!({ "node_id": self.node_id() }),
            );
        }
        Ok(claimed)
    }

    /// Apply `event` if `eligible` still holds on a fresh read; false when it does not
    async fn transition_if<P>(&self, task_id: Uuid, event: TaskEvent, eligible: P) -> EngineResult<bool>
    where
        P: Fn(&TaskEnvelope) -> bool,
    {
        let result = modify_task(
            self.store.as_ref(),
            task_id,
            self.config.engine.max_claim_attempts,
            |task| {
                if !eligible(task) {
                    return Err(EngineError::InvalidState(format!(
                        "task {task_id} is no longer eligible to {}",
                        event.event_type()
                    )));
                }
                TaskStateMachine::transition(task, event.clone())?;
                Ok(())
            },
        )
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(EngineError::InvalidState(_)) | Err(EngineError::TaskNotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Drive a task this node owns
    async fn drive(&self, task_id: Uuid) -> EngineResult<TaskRunOutcome> {
        let root_path = self.load_task(task_id).await?.root_path();
        let token = CancellationToken::new();
        match self.running.entry(task_id) {
            Entry::Occupied(_) => {
                return Err(EngineError::InvalidState(format!(
                    "task {task_id} is already running on this node"
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }

        let liveness = self.spawn_liveness_beat();
        let result = self.executor.execute(task_id, root_path, token).await;
        if let Some(liveness) = liveness {
            liveness.abort();
        }
        self.running.remove(&task_id);
        self.settle_run(task_id, result).await
    }

    /// Keep this node alive in the heartbeat registry while a run is in progress
    fn spawn_liveness_beat(&self) -> Option<JoinHandle<()>> {
        let heartbeats = self.heartbeats.clone()?;
        let node_id = self.node_id().to_string();
        let interval = self.config.engine.poll_interval();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                heartbeats.beat(&node_id);
            }
        }))
    }

    async fn settle_run(
        &self,
        task_id: Uuid,
        result: EngineResult<ActivityRunOutcome>,
    ) -> EngineResult<TaskRunOutcome> {
        match result {
            Ok(ActivityRunOutcome::Completed) => self.settle(task_id, settle_completed).await,
            Ok(ActivityRunOutcome::Failed(reason)) => {
                self.settle(task_id, |task| {
                    TaskStateMachine::transition(task, TaskEvent::Fail(reason.clone()))?;
                    Ok(TaskRunOutcome::Failed(reason.clone()))
                })
                .await
            }
            Ok(ActivityRunOutcome::Suspended) => self.settle(task_id, settle_interrupted).await,
            Ok(ActivityRunOutcome::Deferred(reason)) => self.defer(task_id, &reason).await,
            Err(error) if error.is_transient() => {
                // the store may still be down; the reaper recovers the task if so
                self.defer(task_id, &error.to_string()).await.map_err(|_| error)
            }
            Err(error) => {
                let reason = error.to_string();
                log_error("task_manager", "run_task", &reason, Some(&task_id.to_string()));
                self.settle(task_id, |task| {
                    TaskStateMachine::transition(task, TaskEvent::Fail(reason.clone()))?;
                    Ok(TaskRunOutcome::Failed(reason.clone()))
                })
                .await
            }
        }
    }

    async fn defer(&self, task_id: Uuid, reason: &str) -> EngineResult<TaskRunOutcome> {
        let delay = chrono::Duration::from_std(self.config.engine.auto_resume_delay())
            .map_err(|e| EngineError::Configuration(format!("auto resume delay out of range: {e}")))?;
        warn!(task_id = %task_id, reason = %reason, "Suspending task for automatic resume");

        self.settle(task_id, |task| {
            TaskStateMachine::transition(task, TaskEvent::Suspend)?;
            let resume_at = Utc::now() + delay;
            task.auto_resume_at = Some(resume_at);
            task.result_status = TaskResultStatus::Deferred {
                reason: reason.to_string(),
            };
            Ok(TaskRunOutcome::Deferred(resume_at))
        })
        .await
    }

    /// Write the end of a run, provided this node still owns the task
    async fn settle<F>(&self, task_id: Uuid, mut settle: F) -> EngineResult<TaskRunOutcome>
    where
        F: FnMut(&mut TaskEnvelope) -> EngineResult<TaskRunOutcome>,
    {
        let node_id = self.node_id().to_string();
        if !self.load_task(task_id).await?.is_owned_by(&node_id) {
            warn!(task_id = %task_id, node_id = %node_id, "Task was taken over while running");
            return Ok(TaskRunOutcome::Released);
        }

        let (task, outcome) = modify_task(
            self.store.as_ref(),
            task_id,
            self.config.engine.max_claim_attempts,
            |task| {
                if !task.is_owned_by(&node_id) {
                    return Err(EngineError::InvalidState(format!(
                        "task {task_id} is no longer owned by {node_id}"
                    )));
                }
                settle(task)
            },
        )
        .await?;

        log_task_operation(
            "settle",
            task_id,
            Some(&task.name),
            &task.lifecycle_state.to_string(),
            Some(&task.result_status.to_string()),
        );
        if let Some(event_name) = outcome.event_name() {
            self.publisher.publish_task(
                event_name,
                task_id,
                json!({
                    "lifecycle_state": task.lifecycle_state,
                    "result_status": task.result_status,
                }),
            );
        }
        Ok(outcome)
    }

    fn interrupt_local_run(&self, task_id: Uuid) {
        if let Some(token) = self.running.get(&task_id) {
            token.cancel();
        }
    }

    async fn load_task(&self, task_id: Uuid) -> EngineResult<TaskEnvelope> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))
    }
}

fn settle_completed(task: &mut TaskEnvelope) -> EngineResult<TaskRunOutcome> {
    let now = Utc::now();
    match task.schedule.next_run_after(now) {
        Some(next_run) => {
            let failed_items = task.root_activity.rolled_up_statistics(0).failed;
            task.result_status = if failed_items > 0 {
                TaskResultStatus::PartialError { failed_items }
            } else {
                TaskResultStatus::Success
            };
            task.root_activity.reset_tree();
            TaskStateMachine::transition(task, TaskEvent::Wait(next_run))?;
            Ok(TaskRunOutcome::Rescheduled(next_run))
        }
        None => {
            TaskStateMachine::transition(task, TaskEvent::Finish)?;
            Ok(TaskRunOutcome::Completed(task.result_status.clone()))
        }
    }
}

fn settle_interrupted(task: &mut TaskEnvelope) -> EngineResult<TaskRunOutcome> {
    match task.control_request {
        Some(ControlRequest::Cancel) => {
            TaskStateMachine::transition(task, TaskEvent::Cancel)?;
            Ok(TaskRunOutcome::Cancelled)
        }
        Some(ControlRequest::Suspend) => {
            TaskStateMachine::transition(task, TaskEvent::Suspend)?;
            Ok(TaskRunOutcome::Suspended)
        }
        None => {
            TaskStateMachine::transition(task, TaskEvent::Release)?;
            Ok(TaskRunOutcome::Released)
        }
    }
}

fn suspend_in_progress_activities(task: &mut TaskEnvelope) -> StateMachineResult<()> {
    let mut result = Ok(());
    task.root_activity.for_each_mut(&mut |node| {
        if result.is_ok() && node.work_state.realization_state == ActivityState::InProgress {
            result = ActivityStateMachine::transition(&mut node.work_state, ActivityEvent::Suspend).map(|_| ());
        }
    });
    result
}

fn log_run(joined: Result<(Uuid, EngineResult<TaskRunOutcome>), JoinError>) {
    match joined {
        Ok((task_id, Ok(outcome))) => debug!(task_id = %task_id, outcome = ?outcome, "Task run finished"),
        Ok((task_id, Err(error))) => {
            log_error("task_manager", "run_task", &error.to_string(), Some(&task_id.to_string()));
        }
        Err(error) => log_error("task_manager", "run_task", &error.to_string(), None),
    }
}
