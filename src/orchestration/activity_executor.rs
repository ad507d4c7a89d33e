//! # Activity Executor
//!
//! Drives one activity node, and recursively its children, to a terminal or
//! resumable state.
//!
//! ## Architecture
//!
//! ```text
//! execute(path)
//!   ├─ own work:  claim bucket ─▶ worker pool ─▶ complete / release / fail ─▶ repeat
//!   └─ children:  sequential (stop at first failure) | parallel (join all)
//! ```
//!
//! Every state change is a version-conditioned write through the task store, so
//! the executor holds no authoritative state of its own. A node interrupted at
//! any point resumes from what the store says: buckets that were in flight are
//! released (or reaped) and processed again.
//!
//! ## Outcomes
//!
//! - `Completed`: own buckets and all children are done
//! - `Failed`: an item under stop-on-error, a permanent source error or a child failed
//! - `Suspended`: cancellation or an operator request stopped the drive loop
//! - `Deferred`: a transient infrastructure error; the task should resume later

use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::buckets::{BucketAllocation, BucketManager, BucketManagerConfig, ClaimedBucket};
use crate::config::ActivityEngineConfig;
use crate::constants::events;
use crate::error::{EngineError, EngineResult};
use crate::events::EventPublisher;
use crate::execution::{BackoffCalculator, HandlerContext, ItemHandler, WorkerPool};
use crate::logging::{log_bucket_operation, log_error};
use crate::models::{ActivityPath, CompositionPolicy, TaskEnvelope, WorkDefinition};
use crate::persistence::{modify_work_state, TaskStore};
use crate::registry::HandlerRegistry;
use crate::source::ObjectSource;
use crate::state_machine::{ActivityEvent, ActivityState, ActivityStateMachine};
use crate::statistics::{LiveProgress, OperationStatistics, StatisticsAggregator};

/// How a call to [`ActivityExecutor::execute`] ended
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityRunOutcome {
    Completed,
    Failed(String),
    /// Stopped on request; the node is persisted as SUSPENDED
    Suspended,
    /// Stopped by a transient infrastructure error; eligible for automatic resume
    Deferred(String),
}

impl ActivityRunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ActivityRunOutcome::Completed)
    }
}

/// Where the bucket loop of a node stopped
#[derive(Debug, Clone, PartialEq)]
enum DrivePhase {
    Done,
    Failed(String),
    Suspended,
}

#[derive(Debug, Clone)]
struct ExecutorSettings {
    poll_interval: Duration,
    heartbeat_interval: Duration,
    max_write_attempts: u32,
    failure_limit: usize,
}

#[derive(Clone)]
pub struct ActivityExecutor {
    store: Arc<dyn TaskStore>,
    buckets: BucketManager,
    pool: WorkerPool,
    registry: Arc<HandlerRegistry>,
    publisher: EventPublisher,
    live: Arc<LiveProgress>,
    settings: ExecutorSettings,
}

impl std::fmt::Debug for ActivityExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityExecutor")
            .field("node_id", &self.buckets.node_id())
            .field("handlers", &self.registry.handler_ids())
            .field("settings", &self.settings)
            .finish()
    }
}

impl ActivityExecutor {
    pub fn new(
        config: &ActivityEngineConfig,
        store: Arc<dyn TaskStore>,
        source: Arc<dyn ObjectSource>,
        registry: Arc<HandlerRegistry>,
        publisher: EventPublisher,
        live: Arc<LiveProgress>,
    ) -> Self {
        let buckets = BucketManager::new(
            store.clone(),
            source.clone(),
            config.engine.node_id.clone(),
            BucketManagerConfig {
                max_claim_attempts: config.engine.max_claim_attempts,
                recent_failure_limit: config.worker_pool.recent_failure_limit,
            },
        );
        let pool = WorkerPool::new(
            config.worker_pool.clone(),
            BackoffCalculator::new(config.backoff.clone()),
            source,
        );

        Self {
            store,
            buckets,
            pool,
            registry,
            publisher,
            live,
            settings: ExecutorSettings {
                poll_interval: config.engine.poll_interval(),
                heartbeat_interval: config.engine.heartbeat_interval(),
                max_write_attempts: config.engine.max_claim_attempts,
                failure_limit: config.worker_pool.recent_failure_limit,
            },
        }
    }

    pub fn node_id(&self) -> &str {
        self.buckets.node_id()
    }

    /// Drive the node at `path` and its subtree.
    ///
    /// Returns `Err` only when the outcome itself could not be persisted; every
    /// other problem is folded into the returned [`ActivityRunOutcome`].
    pub fn execute(
        &self,
        task_id: Uuid,
        path: ActivityPath,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, EngineResult<ActivityRunOutcome>> {
        async move { self.execute_node(task_id, &path, &cancel).await }.boxed()
    }

    #[instrument(skip(self, cancel), fields(node_id = %self.node_id(), activity_path = %path))]
    async fn execute_node(
        &self,
        task_id: Uuid,
        path: &ActivityPath,
        cancel: &CancellationToken,
    ) -> EngineResult<ActivityRunOutcome> {
        let task = self.load_task(task_id).await?;
        let node = task.activity(path).ok_or_else(|| EngineError::ActivityNotFound {
            task_id,
            path: path.to_string(),
        })?;
        let state = node.work_state.realization_state;
        let work = node.work.clone();
        let composition = node.composition;
        let children = node.child_paths(path);

        match state {
            ActivityState::Complete => return Ok(ActivityRunOutcome::Completed),
            ActivityState::Failed => {
                let reason = node
                    .work_state
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "activity failed".to_string());
                return Ok(ActivityRunOutcome::Failed(reason));
            }
            _ => {}
        }

        if cancel.is_cancelled() || task.control_request.is_some() {
            if state == ActivityState::InProgress {
                self.suspend_activity(task_id, path, None).await?;
            }
            return Ok(ActivityRunOutcome::Suspended);
        }

        match state {
            ActivityState::NotStarted => {
                self.transition(task_id, path, ActivityEvent::Start).await?;
                self.publisher
                    .publish_activity(events::ACTIVITY_STARTED, task_id, path, None, json!({}));
            }
            ActivityState::Suspended => {
                self.transition(task_id, path, ActivityEvent::Resume).await?;
                self.publisher.publish_activity(
                    events::ACTIVITY_STARTED,
                    task_id,
                    path,
                    None,
                    json!({ "resumed": true }),
                );
            }
            _ => {}
        }

        if let Some(work) = &work {
            match self.drive_buckets(task_id, path, work, cancel).await {
                Ok(DrivePhase::Done) => {}
                Ok(DrivePhase::Failed(reason)) => return Ok(ActivityRunOutcome::Failed(reason)),
                Ok(DrivePhase::Suspended) => {
                    self.suspend_activity(task_id, path, None).await?;
                    return Ok(ActivityRunOutcome::Suspended);
                }
                Err(error) => return self.handle_drive_error(task_id, path, error).await,
            }
        }

        if !children.is_empty() {
            let outcome = match composition {
                CompositionPolicy::Sequential => self.run_sequential(task_id, &children, cancel).await?,
                CompositionPolicy::Parallel => self.run_parallel(task_id, &children, cancel).await?,
            };
            match outcome {
                ActivityRunOutcome::Completed => {}
                ActivityRunOutcome::Failed(reason) => {
                    self.fail_activity(task_id, path, &reason).await?;
                    return Ok(ActivityRunOutcome::Failed(reason));
                }
                ActivityRunOutcome::Suspended => {
                    self.suspend_activity(task_id, path, None).await?;
                    return Ok(ActivityRunOutcome::Suspended);
                }
                ActivityRunOutcome::Deferred(reason) => {
                    self.suspend_activity(task_id, path, None).await?;
                    return Ok(ActivityRunOutcome::Deferred(reason));
                }
            }
        }

        self.transition(task_id, path, ActivityEvent::Complete).await?;
        self.publisher
            .publish_activity(events::ACTIVITY_COMPLETED, task_id, path, None, json!({}));
        info!(task_id = %task_id, activity_path = %path, "Activity completed");
        Ok(ActivityRunOutcome::Completed)
    }

    async fn run_sequential(
        &self,
        task_id: Uuid,
        children: &[ActivityPath],
        cancel: &CancellationToken,
    ) -> EngineResult<ActivityRunOutcome> {
        for child in children {
            match self.execute(task_id, child.clone(), cancel.clone()).await? {
                ActivityRunOutcome::Completed => continue,
                ActivityRunOutcome::Failed(reason) => {
                    let leaf = child.leaf().unwrap_or_default();
                    return Ok(ActivityRunOutcome::Failed(format!("child '{leaf}' failed: {reason}")));
                }
                other => return Ok(other),
            }
        }
        Ok(ActivityRunOutcome::Completed)
    }

    /// All children run to their own end before the parent decides
    async fn run_parallel(
        &self,
        task_id: Uuid,
        children: &[ActivityPath],
        cancel: &CancellationToken,
    ) -> EngineResult<ActivityRunOutcome> {
        let outcomes = join_all(
            children
                .iter()
                .map(|child| self.execute(task_id, child.clone(), cancel.clone())),
        )
        .await;

        let mut failures = Vec::new();
        let mut deferred = None;
        let mut suspended = false;
        for (child, outcome) in children.iter().zip(outcomes) {
            match outcome? {
                ActivityRunOutcome::Completed => {}
                ActivityRunOutcome::Failed(reason) => {
                    failures.push(format!("{}: {reason}", child.leaf().unwrap_or_default()));
                }
                ActivityRunOutcome::Suspended => suspended = true,
                ActivityRunOutcome::Deferred(reason) => {
                    deferred.get_or_insert(reason);
                }
            }
        }

        // unfinished siblings win over failures: the parent cannot fail while work is pending
        if let Some(reason) = deferred {
            return Ok(ActivityRunOutcome::Deferred(reason));
        }
        if suspended {
            return Ok(ActivityRunOutcome::Suspended);
        }
        if !failures.is_empty() {
            return Ok(ActivityRunOutcome::Failed(format!(
                "{} child activities failed: {}",
                failures.len(),
                failures.join("; ")
            )));
        }
        Ok(ActivityRunOutcome::Completed)
    }

    async fn drive_buckets(
        &self,
        task_id: Uuid,
        path: &ActivityPath,
        work: &WorkDefinition,
        cancel: &CancellationToken,
    ) -> EngineResult<DrivePhase> {
        let handler = self.registry.get(&work.handler_id)?;

        loop {
            if cancel.is_cancelled() || self.control_requested(task_id).await? {
                return Ok(DrivePhase::Suspended);
            }

            match self.buckets.get_or_allocate_bucket(task_id, path).await? {
                BucketAllocation::Claimed(bucket) => {
                    if let Some(phase) = self.process_bucket(&bucket, work, handler.clone(), cancel).await? {
                        return Ok(phase);
                    }
                }
                BucketAllocation::WaitForOthers => {
                    debug!(task_id = %task_id, activity_path = %path, "Remaining buckets held by other nodes");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(DrivePhase::Suspended),
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    }
                }
                BucketAllocation::NoMoreBuckets => return Ok(DrivePhase::Done),
                BucketAllocation::NotRunnable(state) => return self.not_runnable(task_id, path, state).await,
            }
        }
    }

    /// The node left IN_PROGRESS underneath us (another node failed or suspended it)
    async fn not_runnable(
        &self,
        task_id: Uuid,
        path: &ActivityPath,
        state: ActivityState,
    ) -> EngineResult<DrivePhase> {
        match state {
            ActivityState::Failed => {
                let task = self.load_task(task_id).await?;
                let reason = task
                    .activity(path)
                    .and_then(|node| node.work_state.failure_reason.clone())
                    .unwrap_or_else(|| "activity failed".to_string());
                Ok(DrivePhase::Failed(reason))
            }
            ActivityState::Complete => Ok(DrivePhase::Done),
            _ => Ok(DrivePhase::Suspended),
        }
    }

    /// Run one claimed bucket. `None` means keep claiming.
    async fn process_bucket(
        &self,
        bucket: &ClaimedBucket,
        work: &WorkDefinition,
        handler: Arc<dyn ItemHandler>,
        cancel: &CancellationToken,
    ) -> EngineResult<Option<DrivePhase>> {
        let task_id = bucket.task_id;
        let path = &bucket.activity_path;
        let path_label = path.to_string();
        log_bucket_operation(
            "claimed",
            task_id,
            &path_label,
            bucket.sequence_number,
            self.node_id(),
            None,
        );
        self.publisher.publish_activity(
            events::BUCKET_CLAIMED,
            task_id,
            path,
            Some(bucket.sequence_number),
            json!({ "node_id": self.node_id() }),
        );

        let aggregator = Arc::new(StatisticsAggregator::new(self.settings.failure_limit));
        self.live.register(task_id, path, aggregator.clone());
        let bucket_cancel = cancel.child_token();
        let claim_lost = Arc::new(AtomicBool::new(false));
        let heartbeat = self.spawn_heartbeat(bucket, &bucket_cancel, &claim_lost);

        let context = HandlerContext {
            task_id,
            activity_path: path.clone(),
            execution_mode: work.execution_mode,
        };
        let report = self
            .pool
            .process(bucket, work, handler, context, aggregator, &bucket_cancel)
            .await;

        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        self.live.unregister(task_id, path);

        if claim_lost.load(Ordering::SeqCst) {
            self.buckets.forget(bucket);
            warn!(
                task_id = %task_id,
                activity_path = %path,
                sequence_number = bucket.sequence_number,
                "Claim lost while processing; results discarded"
            );
            return Ok(None);
        }

        if let Some(source_error) = report.source_error {
            if source_error.is_transient() {
                self.release_quietly(bucket).await?;
                return Err(source_error.into());
            }
            let reason = source_error.to_string();
            return self.fail_bucket(bucket, &report.statistics, reason).await;
        }

        if let Some(reason) = report.unavailable {
            self.release_quietly(bucket).await?;
            return Err(EngineError::ResourceUnavailable(reason));
        }

        if report.interrupted {
            self.release_quietly(bucket).await?;
            return Ok(Some(DrivePhase::Suspended));
        }

        if let Some(reason) = report.aborted {
            return self.fail_bucket(bucket, &report.statistics, reason).await;
        }

        match self.buckets.complete_bucket(bucket, &report.statistics).await {
            Ok(_) => {
                log_bucket_operation(
                    "completed",
                    task_id,
                    &path_label,
                    bucket.sequence_number,
                    self.node_id(),
                    Some(&format!(
                        "processed={} failed={}",
                        report.statistics.items_processed, report.statistics.failed
                    )),
                );
                self.publisher.publish_activity(
                    events::BUCKET_COMPLETED,
                    task_id,
                    path,
                    Some(bucket.sequence_number),
                    json!({
                        "items_processed": report.statistics.items_processed,
                        "succeeded": report.statistics.succeeded,
                        "failed": report.statistics.failed,
                    }),
                );
            }
            Err(EngineError::ClaimLost { .. }) => {
                warn!(
                    task_id = %task_id,
                    activity_path = %path,
                    sequence_number = bucket.sequence_number,
                    "Bucket was reclaimed before completion; results discarded"
                );
            }
            Err(error) => return Err(error),
        }
        Ok(None)
    }

    async fn fail_bucket(
        &self,
        bucket: &ClaimedBucket,
        statistics: &OperationStatistics,
        reason: String,
    ) -> EngineResult<Option<DrivePhase>> {
        match self.buckets.fail_bucket(bucket, statistics, &reason).await {
            Ok(_) => {}
            Err(EngineError::ClaimLost { .. }) => {
                warn!(
                    task_id = %bucket.task_id,
                    sequence_number = bucket.sequence_number,
                    "Bucket was reclaimed before it could be failed"
                );
                return Ok(None);
            }
            Err(error) => return Err(error),
        }

        log_bucket_operation(
            "failed",
            bucket.task_id,
            &bucket.activity_path.to_string(),
            bucket.sequence_number,
            self.node_id(),
            Some(&reason),
        );
        self.publisher.publish_activity(
            events::BUCKET_FAILED,
            bucket.task_id,
            &bucket.activity_path,
            Some(bucket.sequence_number),
            json!({ "reason": reason }),
        );
        self.publisher.publish_activity(
            events::ACTIVITY_FAILED,
            bucket.task_id,
            &bucket.activity_path,
            None,
            json!({ "reason": reason }),
        );
        Ok(Some(DrivePhase::Failed(reason)))
    }

    async fn release_quietly(&self, bucket: &ClaimedBucket) -> EngineResult<()> {
        match self.buckets.release_bucket(bucket).await {
            Ok(()) | Err(EngineError::ClaimLost { .. }) => {}
            Err(error) => return Err(error),
        }
        self.publisher.publish_activity(
            events::BUCKET_RELEASED,
            bucket.task_id,
            &bucket.activity_path,
            Some(bucket.sequence_number),
            json!({ "node_id": self.node_id() }),
        );
        Ok(())
    }

    /// Keep the claim fresh while the pool works; cancel the bucket if it is lost
    fn spawn_heartbeat(
        &self,
        bucket: &ClaimedBucket,
        bucket_cancel: &CancellationToken,
        claim_lost: &Arc<AtomicBool>,
    ) -> Option<JoinHandle<()>> {
        let interval = self.settings.heartbeat_interval;
        if interval.is_zero() {
            return None;
        }

        let buckets = self.buckets.clone();
        let bucket = bucket.clone();
        let cancel = bucket_cancel.clone();
        let lost = claim_lost.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match buckets.extend_claim(&bucket).await {
                    Ok(()) => {}
                    Err(EngineError::ClaimLost { .. }) => {
                        lost.store(true, Ordering::SeqCst);
                        cancel.cancel();
                        break;
                    }
                    Err(error) => {
                        warn!(
                            task_id = %bucket.task_id,
                            sequence_number = bucket.sequence_number,
                            error = %error,
                            "Claim heartbeat failed"
                        );
                    }
                }
            }
        }))
    }

    /// Transient errors suspend the node for a later automatic resume; the rest fail it
    async fn handle_drive_error(
        &self,
        task_id: Uuid,
        path: &ActivityPath,
        error: EngineError,
    ) -> EngineResult<ActivityRunOutcome> {
        let reason = error.to_string();
        if error.is_transient() {
            warn!(task_id = %task_id, activity_path = %path, error = %reason, "Deferring activity");
            self.suspend_activity(task_id, path, Some(&reason)).await?;
            return Ok(ActivityRunOutcome::Deferred(reason));
        }

        log_error("activity_executor", "drive_buckets", &reason, Some(&path.to_string()));
        self.fail_activity(task_id, path, &reason).await?;
        Ok(ActivityRunOutcome::Failed(reason))
    }

    /// Suspend the node, recording `deferral` as its last error in the same write
    async fn suspend_activity(
        &self,
        task_id: Uuid,
        path: &ActivityPath,
        deferral: Option<&str>,
    ) -> EngineResult<()> {
        let (_, suspended) = modify_work_state(
            self.store.as_ref(),
            task_id,
            path,
            self.settings.max_write_attempts,
            |work_state| {
                // stale claims of this node would block every other node until reaped
                self.buckets.release_stale_claims(task_id, path, work_state);
                if let Some(reason) = deferral {
                    work_state.statistics.last_error = Some(reason.to_string());
                }
                if work_state.realization_state == ActivityState::InProgress {
                    ActivityStateMachine::transition(work_state, ActivityEvent::Suspend)?;
                    return Ok(true);
                }
                Ok(false)
            },
        )
        .await?;

        if suspended {
            self.publisher
                .publish_activity(events::ACTIVITY_SUSPENDED, task_id, path, None, json!({}));
        }
        Ok(())
    }

    async fn fail_activity(&self, task_id: Uuid, path: &ActivityPath, reason: &str) -> EngineResult<()> {
        let (_, failed) = modify_work_state(
            self.store.as_ref(),
            task_id,
            path,
            self.settings.max_write_attempts,
            |work_state| {
                if work_state.realization_state == ActivityState::InProgress {
                    ActivityStateMachine::transition(work_state, ActivityEvent::Fail(reason.to_string()))?;
                    return Ok(true);
                }
                Ok(false)
            },
        )
        .await?;

        if failed {
            self.publisher.publish_activity(
                events::ACTIVITY_FAILED,
                task_id,
                path,
                None,
                json!({ "reason": reason }),
            );
        }
        Ok(())
    }

    async fn transition(&self, task_id: Uuid, path: &ActivityPath, event: ActivityEvent) -> EngineResult<()> {
        modify_work_state(
            self.store.as_ref(),
            task_id,
            path,
            self.settings.max_write_attempts,
            |work_state| Ok(ActivityStateMachine::transition(work_state, event.clone())?),
        )
        .await?;
        Ok(())
    }

    async fn control_requested(&self, task_id: Uuid) -> EngineResult<bool> {
        Ok(self.load_task(task_id).await?.control_request.is_some())
    }

    async fn load_task(&self, task_id: Uuid) -> EngineResult<TaskEnvelope> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    /// Help with an activity another node is driving.
    ///
    /// Processes buckets until none is left to claim, then returns how many this
    /// node completed. Never changes the activity's own state except by failing
    /// it when a bucket fails under stop-on-error.
    #[instrument(skip(self, cancel), fields(node_id = %self.node_id(), activity_path = %path))]
    pub async fn join_activity(
        &self,
        task_id: Uuid,
        path: &ActivityPath,
        cancel: &CancellationToken,
    ) -> EngineResult<u64> {
        let task = self.load_task(task_id).await?;
        let node = task.activity(path).ok_or_else(|| EngineError::ActivityNotFound {
            task_id,
            path: path.to_string(),
        })?;
        let Some(work) = node.work.clone() else {
            return Ok(0);
        };
        if node.work_state.realization_state != ActivityState::InProgress {
            return Ok(0);
        }
        let handler = self.registry.get(&work.handler_id)?;

        let mut processed = 0;
        while !cancel.is_cancelled() {
            match self.buckets.get_or_allocate_bucket(task_id, path).await? {
                BucketAllocation::Claimed(bucket) => {
                    match self.process_bucket(&bucket, &work, handler.clone(), cancel).await? {
                        None => processed += 1,
                        Some(_) => break,
                    }
                }
                _ => break,
            }
        }

        debug!(task_id = %task_id, activity_path = %path, processed, "Helper finished");
        Ok(processed)
    }
}
