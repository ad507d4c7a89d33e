//! Bucket claiming across nodes: every object lands in exactly one bucket and
//! every bucket is handed to exactly one node.

mod common;

use activity_engine::buckets::{BucketAllocation, BucketManager, BucketManagerConfig, ClaimedBucket};
use activity_engine::error::EngineError;
use activity_engine::models::{
    ActivityPath, BucketingStrategy, ObjectFilter, ObjectRef, Schedule, TaskEnvelope, WorkDefinition,
};
use activity_engine::persistence::{modify_work_state, InMemoryTaskStore, TaskStore};
use activity_engine::source::{InMemoryObjectSource, ObjectQuery, ObjectSource};
use activity_engine::state_machine::{ActivityEvent, ActivityStateMachine};
use activity_engine::statistics::OperationStatistics;
use activity_engine::ActivityNode;
use common::*;
use proptest::prelude::*;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const PATH: &str = "partition";

async fn started_task(store: &InMemoryTaskStore, work: WorkDefinition) -> Uuid {
    let task = TaskEnvelope::new("partition", ActivityNode::leaf(PATH, work), Schedule::once());
    let task_id = task.task_id;
    store.insert_task(&task).await.unwrap();
    modify_work_state(store, task_id, &ActivityPath::parse(PATH), 5, |work_state| {
        Ok(ActivityStateMachine::transition(work_state, ActivityEvent::Start)?)
    })
    .await
    .unwrap();
    task_id
}

fn manager(store: Arc<InMemoryTaskStore>, source: Arc<InMemoryObjectSource>, node_id: &str) -> BucketManager {
    BucketManager::new(
        store,
        source,
        node_id,
        BucketManagerConfig {
            max_claim_attempts: 20,
            recent_failure_limit: 10,
        },
    )
}

async fn bucket_oids(source: &InMemoryObjectSource, object_type: &str, bucket: &ClaimedBucket) -> Vec<String> {
    let (tx, mut rx) = mpsc::channel(256);
    let query = ObjectQuery {
        object_type: object_type.to_string(),
        filter: ObjectFilter::All,
        segment: bucket.content.clone(),
    };
    source.search(&query, tx).await.unwrap();
    let mut oids = Vec::new();
    while let Some(object) = rx.recv().await {
        oids.push(object.oid);
    }
    oids
}

/// Claim and complete every bucket from one node, returning the oids each covered
async fn drain(manager: &BucketManager, source: &InMemoryObjectSource, task_id: Uuid, object_type: &str) -> Vec<Vec<String>> {
    let path = ActivityPath::parse(PATH);
    let mut buckets = Vec::new();
    loop {
        match manager.get_or_allocate_bucket(task_id, &path).await.unwrap() {
            BucketAllocation::Claimed(bucket) => {
                buckets.push(bucket_oids(source, object_type, &bucket).await);
                manager
                    .complete_bucket(&bucket, &OperationStatistics::default())
                    .await
                    .unwrap();
            }
            BucketAllocation::NoMoreBuckets => return buckets,
            other => panic!("single node should never see {other:?}"),
        }
    }
}

fn assert_exact_cover(buckets: &[Vec<String>], expected: usize) {
    let mut seen = HashMap::new();
    for oid in buckets.iter().flatten() {
        *seen.entry(oid.clone()).or_insert(0) += 1;
    }
    assert_eq!(seen.len(), expected);
    assert!(seen.values().all(|count| *count == 1), "duplicates: {seen:?}");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn interval_buckets_cover_each_object_once(n in 0usize..60, size in 1u64..10) {
        tokio_test::block_on(async {
            let store = Arc::new(InMemoryTaskStore::new());
            let source = user_source(n);
            let task_id = started_task(&store, interval_work("noop", size)).await;
            let buckets = drain(&manager(store, source.clone(), "node-a"), &source, task_id, USER).await;

            let expected_buckets = (n as u64).div_ceil(size) as usize;
            assert_eq!(buckets.len(), expected_buckets);
            assert_exact_cover(&buckets, n);
        });
    }

    #[test]
    fn segmentation_buckets_cover_each_object_once(n in 0usize..60, segments in 1u32..8) {
        tokio_test::block_on(async {
            let store = Arc::new(InMemoryTaskStore::new());
            let source = Arc::new(InMemoryObjectSource::with_objects((0..n).map(|i| {
                ObjectRef::new(format!("user-{i:03}"), USER).with_attribute("region", json!(format!("r{}", i % 7)))
            })));
            let work = WorkDefinition::query(USER, ObjectFilter::All, "noop").with_bucketing(
                BucketingStrategy::FilterSegmentation {
                    partition_key: "region".to_string(),
                    segments,
                },
            );
            let task_id = started_task(&store, work).await;
            let buckets = drain(&manager(store, source.clone(), "node-a"), &source, task_id, USER).await;

            let expected_buckets = if n == 0 { 0 } else { segments as usize };
            assert_eq!(buckets.len(), expected_buckets);
            assert_exact_cover(&buckets, n);
        });
    }
}

#[tokio::test]
async fn test_open_ended_last_interval_covers_late_arrivals() {
    let store = Arc::new(InMemoryTaskStore::new());
    let source = user_source(5);
    let task_id = started_task(&store, interval_work("noop", 2)).await;
    let node = manager(store, source.clone(), "node-a");
    let path = ActivityPath::parse(PATH);

    // estimate of 5 is taken with the first claim
    let BucketAllocation::Claimed(first) = node.get_or_allocate_bucket(task_id, &path).await.unwrap() else {
        panic!("expected a bucket");
    };
    node.complete_bucket(&first, &OperationStatistics::default()).await.unwrap();

    source.insert(ObjectRef::new("user-900", USER));
    source.insert(ObjectRef::new("user-901", USER));

    let mut rest = Vec::new();
    loop {
        match node.get_or_allocate_bucket(task_id, &path).await.unwrap() {
            BucketAllocation::Claimed(bucket) => {
                rest.extend(bucket_oids(&source, USER, &bucket).await);
                node.complete_bucket(&bucket, &OperationStatistics::default()).await.unwrap();
            }
            BucketAllocation::NoMoreBuckets => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(rest.contains(&"user-900".to_string()));
    assert!(rest.contains(&"user-901".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_nodes_never_share_a_bucket() {
    const ITEMS: usize = 50;
    const SIZE: u64 = 3;

    let store = Arc::new(InMemoryTaskStore::new());
    let source = user_source(ITEMS);
    let task_id = started_task(&store, interval_work("noop", SIZE)).await;
    store.inject_conflicts(10);

    let mut handles = Vec::new();
    for node in ["node-a", "node-b", "node-c", "node-d"] {
        let manager = manager(store.clone(), source.clone(), node);
        let source = source.clone();
        handles.push(tokio::spawn(async move {
            let path = ActivityPath::parse(PATH);
            let mut claimed = Vec::new();
            loop {
                match manager.get_or_allocate_bucket(task_id, &path).await {
                    Ok(BucketAllocation::Claimed(bucket)) => {
                        let oids = bucket_oids(&source, USER, &bucket).await;
                        manager
                            .complete_bucket(&bucket, &OperationStatistics::default())
                            .await
                            .unwrap();
                        claimed.push((bucket.sequence_number, oids));
                    }
                    Ok(BucketAllocation::WaitForOthers) => tokio::time::sleep(Duration::from_millis(1)).await,
                    Ok(BucketAllocation::NoMoreBuckets) => return claimed,
                    Ok(BucketAllocation::NotRunnable(state)) => panic!("activity left IN_PROGRESS: {state:?}"),
                    Err(EngineError::ClaimContention { .. }) => tokio::task::yield_now().await,
                    Err(other) => panic!("claim failed: {other}"),
                }
            }
        }));
    }

    let mut sequence_numbers = HashSet::new();
    let mut buckets = Vec::new();
    for handle in handles {
        for (sequence_number, oids) in handle.await.unwrap() {
            assert!(sequence_numbers.insert(sequence_number), "bucket {sequence_number} claimed twice");
            buckets.push(oids);
        }
    }

    assert_eq!(sequence_numbers.len(), (ITEMS as u64).div_ceil(SIZE) as usize);
    assert_exact_cover(&buckets, ITEMS);
    assert!(store.rejected_writes() >= 10);
}
