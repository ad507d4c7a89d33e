//! # Bucket Manager
//!
//! Hands out buckets of an activity to execution nodes with an optimistic
//! compare-and-swap on the task record version:
//!
//! 1. read the task and the activity's work state
//! 2. pick a bucket delegated to this node that no local caller holds
//!    (self-reclaim after restart) or the first READY one, discovering more
//!    buckets when none is left
//! 3. record the claim as in flight locally, mark the bucket DELEGATED with a
//!    fresh claim token and write the work state conditioned on the version
//!    read in step 1
//! 4. on a version conflict, or when a local caller registered the same bucket
//!    first, start over, up to `max_claim_attempts`
//!
//! The in-flight registry is shared by every clone of a manager, so the driver
//! of an activity and a helper on the same node never take each other's bucket.
//!
//! Completion, release and failure verify the claim token before writing, so a
//! node whose claim was reaped cannot overwrite another node's progress.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::discovery::discover_next;
use crate::error::{EngineError, EngineResult};
use crate::models::{ActivityPath, ActivityWorkState, BucketContent, TaskEnvelope};
use crate::persistence::{StoreError, TaskStore};
use crate::source::ObjectSource;
use crate::state_machine::{ActivityEvent, ActivityState, ActivityStateMachine};
use crate::statistics::OperationStatistics;

/// A bucket this node currently holds
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedBucket {
    pub task_id: Uuid,
    pub activity_path: ActivityPath,
    pub sequence_number: u64,
    pub content: BucketContent,
    pub claim_token: Uuid,
    pub claimed_by: String,
}

/// Result of asking for work
#[derive(Debug, Clone, PartialEq)]
pub enum BucketAllocation {
    Claimed(ClaimedBucket),
    /// Everything left is delegated to other nodes
    WaitForOthers,
    /// Every bucket is complete (or there never were any)
    NoMoreBuckets,
    /// The activity is not IN_PROGRESS, so nothing may be claimed
    NotRunnable(ActivityState),
}

#[derive(Debug, Clone)]
pub struct BucketManagerConfig {
    pub max_claim_attempts: u32,
    pub recent_failure_limit: usize,
}

/// (task, activity path, bucket sequence number)
type ClaimKey = (Uuid, String, u64);

#[derive(Clone)]
pub struct BucketManager {
    store: Arc<dyn TaskStore>,
    source: Arc<dyn ObjectSource>,
    node_id: String,
    config: BucketManagerConfig,
    /// Claim tokens of buckets held by callers in this process
    in_flight: Arc<DashMap<ClaimKey, Uuid>>,
}

impl std::fmt::Debug for BucketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketManager")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Allocation {
    Claim(usize),
    Wait,
    Done,
}

impl BucketManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        source: Arc<dyn ObjectSource>,
        node_id: impl Into<String>,
        config: BucketManagerConfig,
    ) -> Self {
        Self {
            store,
            source,
            node_id: node_id.into(),
            config,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Whether a caller in this process holds the bucket
    pub fn is_in_flight(&self, task_id: Uuid, path: &ActivityPath, sequence_number: u64) -> bool {
        self.in_flight
            .contains_key(&(task_id, path.to_string(), sequence_number))
    }

    /// Number of buckets held by callers in this process
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Drop the local record of a claim, e.g. after it was lost to the reaper
    pub fn forget(&self, claimed: &ClaimedBucket) {
        let key = (claimed.task_id, claimed.activity_path.to_string(), claimed.sequence_number);
        self.in_flight
            .remove_if(&key, |_, token| *token == claimed.claim_token);
    }

    /// Release claims of this node on `work_state` that no local caller holds
    pub fn release_stale_claims(&self, task_id: Uuid, path: &ActivityPath, work_state: &mut ActivityWorkState) -> usize {
        work_state
            .bucketing
            .release_delegated_to(&self.node_id, |seq| self.is_in_flight(task_id, path, seq))
    }

    async fn load(&self, task_id: Uuid, path: &ActivityPath) -> EngineResult<(TaskEnvelope, ActivityWorkState)> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        let work_state = task
            .activity(path)
            .ok_or_else(|| EngineError::ActivityNotFound {
                task_id,
                path: path.to_string(),
            })?
            .work_state
            .clone();
        Ok((task, work_state))
    }

    /// Claim the next bucket of the activity at `path`
    #[instrument(skip(self), fields(node_id = %self.node_id, activity_path = %path))]
    pub async fn get_or_allocate_bucket(
        &self,
        task_id: Uuid,
        path: &ActivityPath,
    ) -> EngineResult<BucketAllocation> {
        let attempts = self.config.max_claim_attempts.max(1);

        for attempt in 1..=attempts {
            let (task, mut work_state) = self.load(task_id, path).await?;

            if work_state.realization_state != ActivityState::InProgress {
                return Ok(BucketAllocation::NotRunnable(work_state.realization_state));
            }

            let Some(work) = task.activity(path).and_then(|node| node.work.clone()) else {
                return Ok(BucketAllocation::NoMoreBuckets);
            };

            let before = work_state.bucketing.clone();
            let in_flight = |seq| self.is_in_flight(task_id, path, seq);
            let mut choice = work_state.bucketing.next_claimable(&self.node_id, in_flight);
            if choice.is_none() && !work_state.bucketing.fully_discovered {
                discover_next(&work, &mut work_state.bucketing, self.source.as_ref()).await?;
                choice = work_state.bucketing.next_claimable(&self.node_id, in_flight);
            }

            let allocation = match choice {
                Some(index) => Allocation::Claim(index),
                None if work_state.bucketing.has_delegated() => Allocation::Wait,
                None if !work_state.bucketing.fully_discovered => Allocation::Wait,
                None => Allocation::Done,
            };

            let claimed = match allocation {
                Allocation::Claim(index) => {
                    let token = Uuid::new_v4();
                    let bucket = &mut work_state.bucketing.buckets[index];
                    // registered before the write so a concurrent local caller that
                    // reads the new version already sees the bucket as held
                    let taken = match self
                        .in_flight
                        .entry((task_id, path.to_string(), bucket.sequence_number))
                    {
                        Entry::Occupied(_) => true,
                        Entry::Vacant(slot) => {
                            slot.insert(token);
                            false
                        }
                    };
                    if taken {
                        debug!(
                            sequence_number = bucket.sequence_number,
                            attempt = attempt,
                            "Bucket taken by a local caller, retrying"
                        );
                        tokio::task::yield_now().await;
                        continue;
                    }
                    bucket.delegate(&self.node_id, token, Utc::now());
                    Some(ClaimedBucket {
                        task_id,
                        activity_path: path.clone(),
                        sequence_number: bucket.sequence_number,
                        content: bucket.content.clone(),
                        claim_token: token,
                        claimed_by: self.node_id.clone(),
                    })
                }
                Allocation::Wait | Allocation::Done if work_state.bucketing == before => {
                    // nothing to persist
                    return Ok(match allocation {
                        Allocation::Wait => BucketAllocation::WaitForOthers,
                        _ => BucketAllocation::NoMoreBuckets,
                    });
                }
                _ => None,
            };

            match self
                .store
                .update_work_state(task_id, path, &work_state, task.version)
                .await
            {
                Ok(_) => {
                    return Ok(match (claimed, allocation) {
                        (Some(bucket), _) => {
                            debug!(
                                sequence_number = bucket.sequence_number,
                                attempt = attempt,
                                "Claimed bucket"
                            );
                            BucketAllocation::Claimed(bucket)
                        }
                        (None, Allocation::Wait) => BucketAllocation::WaitForOthers,
                        (None, _) => BucketAllocation::NoMoreBuckets,
                    });
                }
                Err(StoreError::VersionConflict { .. }) => {
                    if let Some(bucket) = &claimed {
                        self.forget(bucket);
                    }
                    debug!(attempt = attempt, "Bucket claim lost the race, retrying");
                }
                Err(error) => {
                    if let Some(bucket) = &claimed {
                        self.forget(bucket);
                    }
                    return Err(error.into());
                }
            }
        }

        warn!(attempts = attempts, "Giving up on bucket claim after repeated conflicts");
        Err(EngineError::ClaimContention {
            task_id,
            path: path.to_string(),
            attempts,
        })
    }

    /// Verify the claim, apply `modify` to the activity's work state and write it back
    async fn modify_claimed<F>(&self, claimed: &ClaimedBucket, mut modify: F) -> EngineResult<ActivityWorkState>
    where
        F: FnMut(&mut ActivityWorkState, usize) -> EngineResult<()>,
    {
        let attempts = self.config.max_claim_attempts.max(1);
        let path = &claimed.activity_path;

        for attempt in 1..=attempts {
            let (task, mut work_state) = self.load(claimed.task_id, path).await?;

            let index = work_state
                .bucketing
                .position_of(claimed.sequence_number)
                .filter(|index| work_state.bucketing.buckets[*index].is_held_with(claimed.claim_token))
                .ok_or_else(|| EngineError::ClaimLost {
                    task_id: claimed.task_id,
                    path: path.to_string(),
                    sequence_number: claimed.sequence_number,
                })?;

            modify(&mut work_state, index)?;

            match self
                .store
                .update_work_state(claimed.task_id, path, &work_state, task.version)
                .await
            {
                Ok(_) => return Ok(work_state),
                Err(StoreError::VersionConflict { .. }) => {
                    debug!(
                        sequence_number = claimed.sequence_number,
                        attempt = attempt,
                        "Bucket write conflicted, retrying"
                    );
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(EngineError::ClaimContention {
            task_id: claimed.task_id,
            path: path.to_string(),
            attempts,
        })
    }

    /// Mark the bucket COMPLETE and merge its statistics in the same write
    #[instrument(skip(self, claimed, statistics), fields(node_id = %self.node_id, sequence_number = claimed.sequence_number))]
    pub async fn complete_bucket(
        &self,
        claimed: &ClaimedBucket,
        statistics: &OperationStatistics,
    ) -> EngineResult<ActivityWorkState> {
        let limit = self.config.recent_failure_limit;
        let result = self
            .modify_claimed(claimed, |work_state, index| {
                work_state.bucketing.buckets[index].complete();
                work_state.statistics.merge(statistics, limit);
                Ok(())
            })
            .await;
        self.forget(claimed);
        let work_state = result?;
        info!(
            activity_path = %claimed.activity_path,
            items_processed = statistics.items_processed,
            failed = statistics.failed,
            "Bucket completed"
        );
        Ok(work_state)
    }

    /// Return the bucket to READY; its uncommitted statistics are discarded
    #[instrument(skip(self, claimed), fields(node_id = %self.node_id, sequence_number = claimed.sequence_number))]
    pub async fn release_bucket(&self, claimed: &ClaimedBucket) -> EngineResult<()> {
        let result = self
            .modify_claimed(claimed, |work_state, index| {
                work_state.bucketing.buckets[index].release();
                Ok(())
            })
            .await;
        self.forget(claimed);
        result?;
        debug!(activity_path = %claimed.activity_path, "Bucket released");
        Ok(())
    }

    /// Mark the bucket FAILED and the activity FAILED in one write
    #[instrument(skip(self, claimed, statistics), fields(node_id = %self.node_id, sequence_number = claimed.sequence_number))]
    pub async fn fail_bucket(
        &self,
        claimed: &ClaimedBucket,
        statistics: &OperationStatistics,
        reason: &str,
    ) -> EngineResult<ActivityWorkState> {
        let limit = self.config.recent_failure_limit;
        let result = self
            .modify_claimed(claimed, |work_state, index| {
                work_state.bucketing.buckets[index].fail(reason);
                work_state.statistics.merge(statistics, limit);
                if work_state.realization_state == ActivityState::InProgress {
                    ActivityStateMachine::transition(work_state, ActivityEvent::Fail(reason.to_string()))?;
                }
                Ok(())
            })
            .await;
        self.forget(claimed);
        let work_state = result?;
        warn!(
            activity_path = %claimed.activity_path,
            reason = %reason,
            "Bucket failed"
        );
        Ok(work_state)
    }

    /// Heartbeat: refresh `claimed_at` so the reaper leaves the claim alone
    pub async fn extend_claim(&self, claimed: &ClaimedBucket) -> EngineResult<()> {
        self.modify_claimed(claimed, |work_state, index| {
            work_state.bucketing.buckets[index].claimed_at = Some(Utc::now());
            Ok(())
        })
        .await?;
        Ok(())
    }
}
