//! Shared fixtures for integration tests: fast configuration, object sets and
//! handlers that record what they saw.

#![allow(dead_code)]

use activity_engine::config::ActivityEngineConfig;
use activity_engine::execution::{HandlerContext, ItemHandler, ItemOutcome, ItemProcessingRequest};
use activity_engine::models::{ActivityNode, BucketingStrategy, ObjectFilter, ObjectRef, WorkDefinition};
use activity_engine::orchestration::TaskManager;
use activity_engine::persistence::InMemoryTaskStore;
use activity_engine::registry::HandlerRegistry;
use activity_engine::source::InMemoryObjectSource;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub const USER: &str = "user";

/// Millisecond-scale timings so tests never wait on production defaults
pub fn fast_config(node_id: &str) -> ActivityEngineConfig {
    let mut config = ActivityEngineConfig::default();
    config.engine.node_id = node_id.to_string();
    config.engine.poll_interval_ms = 10;
    config.engine.max_claim_attempts = 20;
    config.engine.claim_timeout_seconds = 60;
    config.engine.heartbeat_interval_seconds = 1;
    config.engine.auto_resume_delay_seconds = 0;
    config.backoff.base_delay_ms = 1;
    config.backoff.max_delay_ms = 5;
    config.backoff.jitter_enabled = false;
    config
}

pub fn users(count: usize) -> Vec<ObjectRef> {
    (0..count)
        .map(|i| ObjectRef::new(format!("user-{i:03}"), USER))
        .collect()
}

pub fn user_source(count: usize) -> Arc<InMemoryObjectSource> {
    Arc::new(InMemoryObjectSource::with_objects(users(count)))
}

pub fn interval_work(handler_id: &str, size: u64) -> WorkDefinition {
    WorkDefinition::query(USER, ObjectFilter::All, handler_id)
        .with_bucketing(BucketingStrategy::NumericInterval { size })
}

pub fn interval_leaf(identifier: &str, handler_id: &str, size: u64) -> ActivityNode {
    ActivityNode::leaf(identifier, interval_work(handler_id, size))
}

/// Handler that counts calls per object and can be told which objects fail
#[derive(Debug, Default)]
pub struct RecordingHandler {
    calls: Mutex<HashMap<String, u32>>,
    permanent_failures: HashSet<String>,
    /// Fail retryably this many times per object before succeeding
    flaky_attempts: u32,
    delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, oids: &[&str]) -> Self {
        self.permanent_failures = oids.iter().map(|oid| oid.to_string()).collect();
        self
    }

    pub fn flaky(mut self, attempts: u32) -> Self {
        self.flaky_attempts = attempts;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }

    pub fn calls_for(&self, oid: &str) -> u32 {
        self.calls.lock().get(oid).copied().unwrap_or(0)
    }

    pub fn distinct_objects(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ItemHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    async fn handle(&self, request: &ItemProcessingRequest, _context: &HandlerContext) -> ItemOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let oid = request.item.oid.clone();
        let attempt = {
            let mut calls = self.calls.lock();
            let count = calls.entry(oid.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if self.permanent_failures.contains(&oid) {
            return ItemOutcome::failure(format!("cannot process {oid}"), false);
        }
        if attempt <= self.flaky_attempts {
            return ItemOutcome::failure(format!("{oid} temporarily unavailable"), true);
        }
        ItemOutcome::Success
    }
}

pub struct Harness {
    pub store: Arc<InMemoryTaskStore>,
    pub source: Arc<InMemoryObjectSource>,
    pub handler: Arc<RecordingHandler>,
    pub manager: Arc<TaskManager>,
}

impl Harness {
    /// One node with `handler` registered as "recording" over `items` users
    pub fn new(items: usize, handler: RecordingHandler) -> Self {
        Self::with_config(fast_config("node-a"), user_source(items), handler)
    }

    pub fn with_config(
        config: ActivityEngineConfig,
        source: Arc<InMemoryObjectSource>,
        handler: RecordingHandler,
    ) -> Self {
        let store = Arc::new(InMemoryTaskStore::new());
        let handler = Arc::new(handler);
        let registry = HandlerRegistry::new()
            .with_handler("recording", handler.clone())
            .expect("handler registers");
        let manager = TaskManager::new(config, store.clone(), source.clone(), registry)
            .expect("valid test configuration");
        Self {
            store,
            source,
            handler,
            manager: Arc::new(manager),
        }
    }
}

/// Poll `condition` every 5ms until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
