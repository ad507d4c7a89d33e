//! Claim reaping for crashed or stalled execution nodes.
//!
//! The bucket manager never decides that a claim is dead. The reaper does, from
//! two signals: a [`NodeLiveness`] answer for the holding node and the age of the
//! claim's last heartbeat. Reaped buckets go back to READY; RUNNING tasks owned by
//! a dead node go back to RUNNABLE so any node can pick them up.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::models::{BucketState, TaskEnvelope};
use crate::persistence::{modify_task, TaskStore};
use crate::state_machine::{TaskEvent, TaskLifecycleState, TaskStateMachine};

#[async_trait]
pub trait NodeLiveness: Send + Sync {
    async fn is_alive(&self, node_id: &str) -> bool;
}

/// Liveness from periodic heartbeats; a node that never beat counts as dead.
///
/// Every node whose claims a reaper judges must beat into the same registry.
/// A `TaskManager` built `with_heartbeats` beats on every scheduling pass and
/// for as long as it drives a task, whichever entry point started the run.
#[derive(Debug)]
pub struct HeartbeatRegistry {
    beats: DashMap<String, Instant>,
    timeout: Duration,
}

impl HeartbeatRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            beats: DashMap::new(),
            timeout,
        }
    }

    pub fn beat(&self, node_id: &str) {
        self.beats.insert(node_id.to_string(), Instant::now());
    }

    pub fn forget(&self, node_id: &str) {
        self.beats.remove(node_id);
    }
}

#[async_trait]
impl NodeLiveness for HeartbeatRegistry {
    async fn is_alive(&self, node_id: &str) -> bool {
        self.beats
            .get(node_id)
            .is_some_and(|last| last.elapsed() <= self.timeout)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub buckets_released: usize,
    pub tasks_recovered: usize,
}

pub struct ClaimReaper {
    store: Arc<dyn TaskStore>,
    liveness: Arc<dyn NodeLiveness>,
    claim_timeout: chrono::Duration,
    max_attempts: u32,
}

impl std::fmt::Debug for ClaimReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimReaper")
            .field("claim_timeout", &self.claim_timeout)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Every node a task currently depends on: its runner and all bucket holders
fn referenced_nodes(task: &TaskEnvelope) -> BTreeSet<String> {
    let mut nodes = BTreeSet::new();
    if task.lifecycle_state == TaskLifecycleState::Running {
        if let Some(node) = &task.execution_node_id {
            nodes.insert(node.clone());
        }
    }
    for (_, node) in task.root_activity.nodes() {
        for bucket in &node.work_state.bucketing.buckets {
            if let (BucketState::Delegated, Some(holder)) = (bucket.state, &bucket.claimed_by) {
                nodes.insert(holder.clone());
            }
        }
    }
    nodes
}

impl ClaimReaper {
    pub fn new(
        store: Arc<dyn TaskStore>,
        liveness: Arc<dyn NodeLiveness>,
        claim_timeout: Duration,
        max_attempts: u32,
    ) -> EngineResult<Self> {
        let claim_timeout = chrono::Duration::from_std(claim_timeout)
            .map_err(|e| EngineError::Configuration(format!("claim timeout out of range: {e}")))?;
        Ok(Self {
            store,
            liveness,
            claim_timeout,
            max_attempts,
        })
    }

    /// One pass over all open tasks
    #[instrument(skip(self))]
    pub async fn reap(&self) -> EngineResult<ReapReport> {
        let mut report = ReapReport::default();
        let tasks = self.store.list_tasks(TaskLifecycleState::open()).await?;

        for task in tasks {
            let mut dead = HashSet::new();
            for node in referenced_nodes(&task) {
                if !self.liveness.is_alive(&node).await {
                    dead.insert(node);
                }
            }

            let now = Utc::now();
            let timeout = self.claim_timeout;
            let is_stale = |state: BucketState, holder: Option<&String>, expired: bool| {
                state == BucketState::Delegated && (expired || holder.is_some_and(|h| dead.contains(h)))
            };

            let needs_reaping = task.root_activity.nodes().iter().any(|(_, node)| {
                node.work_state.bucketing.buckets.iter().any(|bucket| {
                    is_stale(
                        bucket.state,
                        bucket.claimed_by.as_ref(),
                        bucket.is_claim_expired(now, timeout),
                    )
                })
            }) || (task.lifecycle_state == TaskLifecycleState::Running
                && task
                    .execution_node_id
                    .as_ref()
                    .is_some_and(|node| dead.contains(node)));

            if !needs_reaping {
                continue;
            }

            let result = modify_task(self.store.as_ref(), task.task_id, self.max_attempts, |task| {
                let mut released = 0;
                task.root_activity.for_each_mut(&mut |node| {
                    for bucket in &mut node.work_state.bucketing.buckets {
                        if is_stale(
                            bucket.state,
                            bucket.claimed_by.as_ref(),
                            bucket.is_claim_expired(now, timeout),
                        ) {
                            bucket.release();
                            released += 1;
                        }
                    }
                });

                let owner_dead = task.lifecycle_state == TaskLifecycleState::Running
                    && task
                        .execution_node_id
                        .as_ref()
                        .is_some_and(|node| dead.contains(node));
                if owner_dead {
                    TaskStateMachine::transition(task, TaskEvent::Release)?;
                }
                Ok((released, owner_dead))
            })
            .await;

            match result {
                Ok((_, (released, recovered))) => {
                    if released > 0 || recovered {
                        info!(
                            task_id = %task.task_id,
                            buckets_released = released,
                            task_recovered = recovered,
                            "Reaped stale claims"
                        );
                    }
                    report.buckets_released += released;
                    report.tasks_recovered += usize::from(recovered);
                }
                Err(EngineError::TaskNotFound(task_id)) => {
                    warn!(task_id = %task_id, "Task vanished while reaping");
                }
                Err(error) => return Err(error),
            }
        }

        Ok(report)
    }
}
