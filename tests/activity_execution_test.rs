//! Activity execution through the task manager: bucketing, error policies,
//! composition and resumability.

mod common;

use activity_engine::constants::events;
use activity_engine::models::{
    ActivityNode, ActivityPath, CompositionPolicy, ErrorPolicy, Schedule, TaskResultStatus,
};
use activity_engine::orchestration::{TaskManager, TaskRunOutcome};
use activity_engine::persistence::InMemoryTaskStore;
use activity_engine::registry::HandlerRegistry;
use activity_engine::source::SourceError;
use activity_engine::state_machine::{ActivityState, TaskLifecycleState};
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_interval_buckets_process_every_item() {
    let harness = Harness::new(7, RecordingHandler::new());
    let work = interval_work("recording", 3).with_concurrency(2);
    let task_id = harness
        .manager
        .submit("seven users", ActivityNode::leaf("recompute", work), Schedule::once())
        .await
        .unwrap();

    let outcome = harness.manager.run_task(task_id).await.unwrap();
    assert_eq!(outcome, TaskRunOutcome::Completed(TaskResultStatus::Success));

    let progress = harness.manager.get_progress(task_id).await.unwrap();
    let activity = progress.activity("recompute").unwrap();
    assert_eq!(activity.state, ActivityState::Complete);
    assert_eq!(activity.buckets.total, 3);
    assert_eq!(activity.buckets.complete, 3);
    assert_eq!(activity.statistics.items_processed, 7);
    assert_eq!(activity.statistics.succeeded, 7);
    assert_eq!(activity.statistics.failed, 0);
    assert_eq!(harness.handler.distinct_objects(), 7);
}

#[tokio::test]
async fn test_empty_object_set_completes_without_buckets() {
    let harness = Harness::new(0, RecordingHandler::new());
    let mut events_rx = harness.manager.publisher().subscribe();
    let task_id = harness
        .manager
        .submit("nobody", interval_leaf("recompute", "recording", 5), Schedule::once())
        .await
        .unwrap();

    let outcome = harness.manager.run_task(task_id).await.unwrap();
    assert_eq!(outcome, TaskRunOutcome::Completed(TaskResultStatus::Success));

    let progress = harness.manager.get_progress(task_id).await.unwrap();
    let activity = progress.activity("recompute").unwrap();
    assert_eq!(activity.state, ActivityState::Complete);
    assert_eq!(activity.buckets.total, 0);
    assert!(activity.statistics.is_empty());
    assert_eq!(harness.handler.total_calls(), 0);

    while let Ok(event) = events_rx.try_recv() {
        assert_ne!(event.name, events::BUCKET_CLAIMED);
    }
}

#[tokio::test]
async fn test_stop_on_error_fails_bucket_and_task() {
    let harness = Harness::new(10, RecordingHandler::new().failing_on(&["user-004"]));
    let work = interval_work("recording", 5)
        .with_concurrency(1)
        .with_error_policy(ErrorPolicy::StopOnError);
    let task_id = harness
        .manager
        .submit("strict", ActivityNode::leaf("recompute", work), Schedule::once())
        .await
        .unwrap();

    let outcome = harness.manager.run_task(task_id).await.unwrap();
    match &outcome {
        TaskRunOutcome::Failed(reason) => assert!(reason.contains("user-004"), "reason: {reason}"),
        other => panic!("expected a failed run, got {other:?}"),
    }

    let progress = harness.manager.get_progress(task_id).await.unwrap();
    assert!(matches!(progress.result_status, TaskResultStatus::FatalError { .. }));
    let activity = progress.activity("recompute").unwrap();
    assert_eq!(activity.state, ActivityState::Failed);
    assert_eq!(activity.buckets.failed, 1);
    assert_eq!(activity.buckets.complete, 0);
    assert_eq!(activity.buckets.delegated, 0);
    assert_eq!(activity.statistics.failed, 1);
    assert!(activity.statistics.items_processed <= 10);
    assert_eq!(harness.handler.calls_for("user-004"), 1);
    // the second bucket was never claimed
    assert_eq!(harness.handler.calls_for("user-007"), 0);
}

#[tokio::test]
async fn test_continue_on_error_counts_failures_and_retries() {
    let harness = Harness::new(6, RecordingHandler::new().flaky(2).failing_on(&["user-005"]));
    let work = interval_work("recording", 3)
        .with_error_policy(ErrorPolicy::ContinueOnError { max_retries: 3 });
    let task_id = harness
        .manager
        .submit("lenient", ActivityNode::leaf("recompute", work), Schedule::once())
        .await
        .unwrap();

    let outcome = harness.manager.run_task(task_id).await.unwrap();
    assert_eq!(
        outcome,
        TaskRunOutcome::Completed(TaskResultStatus::PartialError { failed_items: 1 })
    );

    let progress = harness.manager.get_progress(task_id).await.unwrap();
    let stats = &progress.activity("recompute").unwrap().statistics;
    assert_eq!(stats.items_processed, 6);
    assert_eq!(stats.succeeded, 5);
    assert_eq!(stats.failed, 1);
    // two retryable failures on each of the five healthy objects
    assert_eq!(stats.retries, 10);
    assert_eq!(stats.recent_failures.len(), 1);
    assert_eq!(stats.recent_failures[0].item, "user-005");
    assert_eq!(harness.handler.calls_for("user-001"), 3);
}

#[tokio::test]
async fn test_parallel_children_finish_before_parent_fails() {
    let harness = Harness::new(4, RecordingHandler::new().failing_on(&["user-002"]));
    let strict = ActivityNode::leaf(
        "strict",
        interval_work("recording", 2).with_error_policy(ErrorPolicy::StopOnError),
    );
    let root = ActivityNode::composite(
        "root",
        CompositionPolicy::Parallel,
        vec![
            strict,
            interval_leaf("lenient", "recording", 2),
            interval_leaf("other", "recording", 4),
        ],
    );
    let task_id = harness.manager.submit("fan-out", root, Schedule::once()).await.unwrap();

    let outcome = harness.manager.run_task(task_id).await.unwrap();
    match &outcome {
        TaskRunOutcome::Failed(reason) => {
            assert!(reason.starts_with("1 child activities failed"), "reason: {reason}");
            assert!(reason.contains("strict"));
        }
        other => panic!("expected a failed run, got {other:?}"),
    }

    let progress = harness.manager.get_progress(task_id).await.unwrap();
    assert_eq!(progress.activity("root").unwrap().state, ActivityState::Failed);
    assert_eq!(progress.activity("root/strict").unwrap().state, ActivityState::Failed);
    assert_eq!(progress.activity("root/lenient").unwrap().state, ActivityState::Complete);
    assert_eq!(progress.activity("root/other").unwrap().state, ActivityState::Complete);
    assert_eq!(progress.activity("root/other").unwrap().statistics.items_processed, 4);
}

#[tokio::test]
async fn test_sequential_failure_leaves_later_children_untouched() {
    let harness = Harness::new(3, RecordingHandler::new().failing_on(&["user-000"]));
    let root = ActivityNode::composite(
        "root",
        CompositionPolicy::Sequential,
        vec![
            ActivityNode::leaf(
                "first",
                interval_work("recording", 3).with_error_policy(ErrorPolicy::StopOnError),
            ),
            interval_leaf("second", "recording", 3),
        ],
    );
    let task_id = harness.manager.submit("pipeline", root, Schedule::once()).await.unwrap();

    let outcome = harness.manager.run_task(task_id).await.unwrap();
    assert!(matches!(&outcome, TaskRunOutcome::Failed(reason) if reason.starts_with("child 'first' failed")));

    let progress = harness.manager.get_progress(task_id).await.unwrap();
    assert_eq!(progress.activity("root/second").unwrap().state, ActivityState::NotStarted);
    assert_eq!(progress.activity("root/second").unwrap().buckets.total, 0);
}

#[tokio::test]
async fn test_suspend_mid_run_then_resume_matches_uninterrupted_run() {
    let slow = RecordingHandler::new().with_delay(Duration::from_millis(10));
    let harness = Harness::new(20, slow);
    let work = interval_work("recording", 5).with_concurrency(1);
    let task_id = harness
        .manager
        .submit("resumable", ActivityNode::leaf("recompute", work), Schedule::once())
        .await
        .unwrap();

    let manager = harness.manager.clone();
    let run = tokio::spawn(async move { manager.run_task(task_id).await });

    let manager = harness.manager.clone();
    assert!(
        eventually(|| {
            let manager = manager.clone();
            async move {
                manager
                    .get_progress(task_id)
                    .await
                    .map(|p| p.activity("recompute").is_some_and(|a| a.buckets.complete >= 1))
                    .unwrap_or(false)
            }
        })
        .await
    );
    harness.manager.suspend(task_id).await.unwrap();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, TaskRunOutcome::Suspended);
    let progress = harness.manager.get_progress(task_id).await.unwrap();
    assert_eq!(progress.lifecycle_state, TaskLifecycleState::Suspended);
    let activity = progress.activity("recompute").unwrap();
    assert_eq!(activity.state, ActivityState::Suspended);
    assert_eq!(activity.buckets.delegated, 0);
    assert!(activity.statistics.items_processed < 20);

    harness.manager.resume(task_id).await.unwrap();
    let outcome = harness.manager.run_task(task_id).await.unwrap();
    assert_eq!(outcome, TaskRunOutcome::Completed(TaskResultStatus::Success));

    let stats = harness.manager.get_progress(task_id).await.unwrap().totals;
    assert_eq!(stats.items_processed, 20);
    assert_eq!(stats.succeeded, 20);
    assert_eq!(harness.handler.distinct_objects(), 20);
}

#[tokio::test]
async fn test_transient_source_error_defers_and_auto_resumes() {
    let harness = Harness::new(6, RecordingHandler::new());
    harness
        .source
        .fail_next_search(SourceError::Transient("repository timeout".to_string()));
    let task_id = harness
        .manager
        .submit("flaky repo", interval_leaf("recompute", "recording", 3), Schedule::once())
        .await
        .unwrap();

    let outcome = harness.manager.run_task(task_id).await.unwrap();
    assert!(matches!(outcome, TaskRunOutcome::Deferred(_)), "got {outcome:?}");

    let progress = harness.manager.get_progress(task_id).await.unwrap();
    assert_eq!(progress.lifecycle_state, TaskLifecycleState::Suspended);
    match &progress.result_status {
        TaskResultStatus::Deferred { reason } => assert!(reason.contains("repository timeout")),
        other => panic!("expected a deferred result, got {other:?}"),
    }
    let activity = progress.activity("recompute").unwrap();
    assert_eq!(activity.state, ActivityState::Suspended);
    assert_eq!(activity.buckets.delegated, 0);
    assert!(activity
        .statistics
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("repository timeout")));
    assert!(progress
        .totals
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("repository timeout")));

    let runs = harness.manager.run_ready_tasks(4).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(
        runs[0].1.as_ref().unwrap(),
        &TaskRunOutcome::Completed(TaskResultStatus::Success)
    );
    let stats = harness.manager.get_progress(task_id).await.unwrap().totals;
    assert_eq!(stats.succeeded, 6);
}

#[tokio::test]
async fn test_permanent_source_error_closes_task_with_fatal_error() {
    let harness = Harness::new(6, RecordingHandler::new());
    harness
        .source
        .fail_next_search(SourceError::Permanent("unknown object type".to_string()));
    let task_id = harness
        .manager
        .submit("broken repo", interval_leaf("recompute", "recording", 3), Schedule::once())
        .await
        .unwrap();

    let outcome = harness.manager.run_task(task_id).await.unwrap();
    assert!(matches!(outcome, TaskRunOutcome::Failed(_)));

    let progress = harness.manager.get_progress(task_id).await.unwrap();
    assert_eq!(progress.lifecycle_state, TaskLifecycleState::Closed);
    match &progress.result_status {
        TaskResultStatus::FatalError { reason } => assert!(reason.contains("unknown object type")),
        other => panic!("expected a fatal error, got {other:?}"),
    }
    let activity = progress.activity("recompute").unwrap();
    assert_eq!(activity.state, ActivityState::Failed);
    assert!(activity.failure_reason.as_deref().unwrap().contains("unknown object type"));
}

/// Drive a 40-item activity on `node-a` while `helper_node` joins it; returns
/// how many buckets the helper completed
async fn run_with_helper(helper_node: &str) -> u64 {
    const ITEMS: usize = 40;

    let store = Arc::new(InMemoryTaskStore::new());
    let source = user_source(ITEMS);
    let handler = Arc::new(RecordingHandler::new().with_delay(Duration::from_millis(5)));
    let node = |node_id: &str| {
        let registry = HandlerRegistry::new()
            .with_handler("recording", handler.clone())
            .unwrap();
        Arc::new(TaskManager::new(fast_config(node_id), store.clone(), source.clone(), registry).unwrap())
    };
    let owner = node("node-a");
    let helper = if helper_node == owner.node_id() {
        owner.clone()
    } else {
        node(helper_node)
    };

    let work = interval_work("recording", 4).with_concurrency(1);
    let task_id = owner
        .submit("shared", ActivityNode::leaf("recompute", work), Schedule::once())
        .await
        .unwrap();
    let run = {
        let owner = owner.clone();
        tokio::spawn(async move { owner.run_task(task_id).await })
    };

    let path = ActivityPath::parse("recompute");
    let observer = owner.clone();
    assert!(
        eventually(|| {
            let observer = observer.clone();
            async move {
                observer
                    .get_progress(task_id)
                    .await
                    .map(|p| p.activity("recompute").is_some_and(|a| a.state == ActivityState::InProgress))
                    .unwrap_or(false)
            }
        })
        .await
    );
    let helped = helper
        .join_activity(task_id, &path, &CancellationToken::new())
        .await
        .unwrap();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, TaskRunOutcome::Completed(TaskResultStatus::Success));

    let progress = owner.get_progress(task_id).await.unwrap();
    let activity = progress.activity("recompute").unwrap();
    assert_eq!(activity.buckets.total, 10);
    assert_eq!(activity.buckets.complete, 10);
    assert_eq!(activity.statistics.succeeded, ITEMS as u64);
    assert!(helped <= 10);
    assert_eq!(handler.distinct_objects(), ITEMS);
    assert_eq!(handler.total_calls(), ITEMS as u32);
    helped
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_helper_node_shares_buckets_without_duplicates() {
    run_with_helper("node-b").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_helper_on_driving_node_never_takes_the_drivers_bucket() {
    run_with_helper("node-a").await;
}
