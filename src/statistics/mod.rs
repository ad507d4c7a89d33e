//! # Statistics & Reporting
//!
//! Per-bucket counters collected by workers through a mutex-protected
//! [`StatisticsAggregator`], merged into the activity's persisted
//! [`OperationStatistics`] by the driver when the bucket completes, and rolled up
//! the tree for [`ProgressSnapshot`]s.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{ActivityPath, BucketCounts, TaskEnvelope, TaskResultStatus};
use crate::state_machine::{ActivityState, TaskLifecycleState};

/// One recorded item failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub item: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperationStatistics {
    pub items_processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub retries: u64,
    pub wall_clock_start: Option<DateTime<Utc>>,
    pub wall_clock_end: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub recent_failures: Vec<FailureRecord>,
}

impl OperationStatistics {
    pub fn is_empty(&self) -> bool {
        self.items_processed == 0 && self.retries == 0
    }

    /// Add `other` into `self`. Wall clock widens to cover both; failures stay bounded.
    pub fn merge(&mut self, other: &OperationStatistics, failure_limit: usize) {
        self.items_processed += other.items_processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.retries += other.retries;

        self.wall_clock_start = match (self.wall_clock_start, other.wall_clock_start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.wall_clock_end = match (self.wall_clock_end, other.wall_clock_end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if other.last_error.is_some() {
            self.last_error = other.last_error.clone();
        }

        self.recent_failures
            .extend(other.recent_failures.iter().cloned());
        if self.recent_failures.len() > failure_limit {
            let excess = self.recent_failures.len() - failure_limit;
            self.recent_failures.drain(..excess);
        }
    }

    /// Wall-clock span in milliseconds, if both ends are known
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.wall_clock_start, self.wall_clock_end) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Shared counters for one bucket run; workers record, the driver snapshots
#[derive(Debug)]
pub struct StatisticsAggregator {
    inner: Mutex<OperationStatistics>,
    failure_limit: usize,
}

impl StatisticsAggregator {
    pub fn new(failure_limit: usize) -> Self {
        let stats = OperationStatistics {
            wall_clock_start: Some(Utc::now()),
            ..OperationStatistics::default()
        };
        Self {
            inner: Mutex::new(stats),
            failure_limit,
        }
    }

    pub fn record_success(&self) {
        let mut stats = self.inner.lock();
        stats.items_processed += 1;
        stats.succeeded += 1;
    }

    pub fn record_skip(&self) {
        let mut stats = self.inner.lock();
        stats.items_processed += 1;
        stats.skipped += 1;
    }

    pub fn record_retry(&self) {
        self.inner.lock().retries += 1;
    }

    pub fn record_failure(&self, item: &str, reason: &str) {
        let mut stats = self.inner.lock();
        stats.items_processed += 1;
        stats.failed += 1;
        stats.last_error = Some(reason.to_string());
        stats.recent_failures.push(FailureRecord {
            item: item.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        if stats.recent_failures.len() > self.failure_limit {
            stats.recent_failures.remove(0);
        }
    }

    /// Record an error that is not tied to one item (object source, panics)
    pub fn record_error(&self, reason: &str) {
        self.inner.lock().last_error = Some(reason.to_string());
    }

    pub fn snapshot(&self) -> OperationStatistics {
        self.inner.lock().clone()
    }

    /// Close the wall clock and return the final counters
    pub fn finish(&self) -> OperationStatistics {
        let mut stats = self.inner.lock();
        stats.wall_clock_end = Some(Utc::now());
        stats.clone()
    }
}

/// Uncommitted statistics of buckets currently being processed on this node
#[derive(Debug, Default)]
pub struct LiveProgress {
    runs: DashMap<(Uuid, String), Arc<StatisticsAggregator>>,
}

impl LiveProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: Uuid, path: &ActivityPath, aggregator: Arc<StatisticsAggregator>) {
        self.runs.insert((task_id, path.to_string()), aggregator);
    }

    pub fn unregister(&self, task_id: Uuid, path: &ActivityPath) {
        self.runs.remove(&(task_id, path.to_string()));
    }

    pub fn snapshot(&self, task_id: Uuid, path: &ActivityPath) -> Option<OperationStatistics> {
        self.runs
            .get(&(task_id, path.to_string()))
            .map(|aggregator| aggregator.snapshot())
    }
}

/// Progress of one activity node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityProgress {
    pub path: String,
    pub state: ActivityState,
    pub buckets: BucketCounts,
    pub fully_discovered: bool,
    pub estimated_total: Option<u64>,
    /// Committed statistics of completed buckets
    pub statistics: OperationStatistics,
    /// Counters of the bucket in flight on this node, not yet committed
    pub uncommitted: Option<OperationStatistics>,
    pub failure_reason: Option<String>,
}

/// Read-only view of a task for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: Uuid,
    pub name: String,
    pub lifecycle_state: TaskLifecycleState,
    pub result_status: TaskResultStatus,
    pub execution_node_id: Option<String>,
    pub activities: Vec<ActivityProgress>,
    /// Committed statistics rolled up over the whole tree
    pub totals: OperationStatistics,
    pub taken_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn from_task(task: &TaskEnvelope, live: &LiveProgress, failure_limit: usize) -> Self {
        let mut totals = OperationStatistics::default();
        let activities = task
            .root_activity
            .nodes()
            .into_iter()
            .map(|(path, node)| {
                let work_state = &node.work_state;
                totals.merge(&work_state.statistics, failure_limit);
                ActivityProgress {
                    state: work_state.realization_state,
                    buckets: work_state.bucketing.counts(),
                    fully_discovered: work_state.bucketing.fully_discovered,
                    estimated_total: work_state.bucketing.estimated_total,
                    statistics: work_state.statistics.clone(),
                    uncommitted: live.snapshot(task.task_id, &path),
                    failure_reason: work_state.failure_reason.clone(),
                    path: path.to_string(),
                }
            })
            .collect();

        Self {
            task_id: task.task_id,
            name: task.name.clone(),
            lifecycle_state: task.lifecycle_state,
            result_status: task.result_status.clone(),
            execution_node_id: task.execution_node_id.clone(),
            activities,
            totals,
            taken_at: Utc::now(),
        }
    }

    pub fn activity(&self, path: &str) -> Option<&ActivityProgress> {
        self.activities.iter().find(|a| a.path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregator_counts() {
        let aggregator = StatisticsAggregator::new(2);
        aggregator.record_success();
        aggregator.record_skip();
        aggregator.record_retry();
        aggregator.record_failure("u-1", "first");
        aggregator.record_failure("u-2", "second");
        aggregator.record_failure("u-3", "third");

        let stats = aggregator.finish();
        assert_eq!(stats.items_processed, 5);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.last_error.as_deref(), Some("third"));
        assert_eq!(stats.recent_failures.len(), 2);
        assert_eq!(stats.recent_failures[0].item, "u-2");
        assert!(stats.duration_ms().is_some());
    }

    #[test]
    fn test_merge_widens_wall_clock_and_bounds_failures() {
        let early = Utc::now() - chrono::Duration::seconds(10);
        let late = Utc::now();
        let mut committed = OperationStatistics {
            items_processed: 3,
            succeeded: 3,
            wall_clock_start: Some(early),
            wall_clock_end: Some(early),
            ..Default::default()
        };
        let bucket = OperationStatistics {
            items_processed: 2,
            succeeded: 1,
            failed: 1,
            wall_clock_start: Some(late),
            wall_clock_end: Some(late),
            last_error: Some("timeout".to_string()),
            recent_failures: vec![
                FailureRecord {
                    item: "a".to_string(),
                    reason: "x".to_string(),
                    at: late,
                },
                FailureRecord {
                    item: "b".to_string(),
                    reason: "timeout".to_string(),
                    at: late,
                },
            ],
            ..Default::default()
        };

        committed.merge(&bucket, 1);
        assert_eq!(committed.items_processed, 5);
        assert_eq!(committed.succeeded, 4);
        assert_eq!(committed.failed, 1);
        assert_eq!(committed.wall_clock_start, Some(early));
        assert_eq!(committed.wall_clock_end, Some(late));
        assert_eq!(committed.last_error.as_deref(), Some("timeout"));
        assert_eq!(committed.recent_failures.len(), 1);
        assert_eq!(committed.recent_failures[0].item, "b");
    }

    #[test]
    fn test_live_progress_registry() {
        let live = LiveProgress::new();
        let task_id = Uuid::new_v4();
        let path = ActivityPath::root("reconcile");
        let aggregator = Arc::new(StatisticsAggregator::new(5));
        aggregator.record_success();

        live.register(task_id, &path, aggregator.clone());
        assert_eq!(live.snapshot(task_id, &path).map(|s| s.succeeded), Some(1));
        live.unregister(task_id, &path);
        assert!(live.snapshot(task_id, &path).is_none());
    }
}
