//! # Worker Pool
//!
//! Processes the items of one claimed bucket:
//!
//! ```text
//! object source ──search──▶ [bounded queue] ──▶ [Semaphore] ──▶ handler ──▶ aggregator
//! ```
//!
//! A single producer task streams the bucket's objects into a queue of
//! `concurrency * queue_factor` slots, so it blocks while the workers are busy.
//! The dispatcher takes one item at a time, waits for a permit and spawns the
//! handler call. Cancellation, stop-on-error and an unavailable downstream
//! system are checked between dequeues; items already running always finish
//! before `process` returns.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use super::item::{HandlerContext, ItemHandler, ItemOutcome, ItemProcessingRequest};
use super::retry::BackoffCalculator;
use crate::buckets::ClaimedBucket;
use crate::config::WorkerPoolConfig;
use crate::models::{ErrorPolicy, ObjectRef, ObjectSetSpec, WorkDefinition};
use crate::source::{stream_explicit_targets, ObjectQuery, ObjectSource, SourceError};
use crate::statistics::{OperationStatistics, StatisticsAggregator};

/// How one bucket run ended
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRunReport {
    pub statistics: OperationStatistics,
    /// Set when stop-on-error halted dispatch; holds the first failure
    pub aborted: Option<String>,
    /// Cancellation stopped dispatch before the object stream was exhausted
    pub interrupted: bool,
    /// The object stream itself failed
    pub source_error: Option<SourceError>,
    /// A handler reported its downstream system unreachable; holds the first report
    pub unavailable: Option<String>,
    pub items_dispatched: u64,
}

impl BucketRunReport {
    /// Every item of the bucket was handled and nothing forced a stop
    pub fn is_clean(&self) -> bool {
        self.aborted.is_none()
            && !self.interrupted
            && self.source_error.is_none()
            && self.unavailable.is_none()
    }
}

/// State shared between the dispatcher and its workers
#[derive(Default)]
struct RunControl {
    stop: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    unavailable: Mutex<Option<String>>,
}

impl RunControl {
    fn abort(&self, reason: String) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            *self.abort_reason.lock() = Some(reason);
        }
    }

    fn halt_unavailable(&self, reason: String) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            *self.unavailable.lock() = Some(reason);
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    config: WorkerPoolConfig,
    backoff: BackoffCalculator,
    source: Arc<dyn ObjectSource>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, backoff: BackoffCalculator, source: Arc<dyn ObjectSource>) -> Self {
        Self {
            config,
            backoff,
            source,
        }
    }

    pub fn concurrency_for(&self, work: &WorkDefinition) -> usize {
        work.concurrency
            .unwrap_or(self.config.default_concurrency)
            .max(1)
    }

    fn spawn_producer(
        &self,
        bucket: &ClaimedBucket,
        work: &WorkDefinition,
        sink: mpsc::Sender<ObjectRef>,
    ) -> tokio::task::JoinHandle<Result<u64, SourceError>> {
        match &work.object_set {
            ObjectSetSpec::Query {
                object_type,
                filter,
            } => {
                let source = self.source.clone();
                let query = ObjectQuery {
                    object_type: object_type.clone(),
                    filter: filter.clone(),
                    segment: bucket.content.clone(),
                };
                tokio::spawn(async move { source.search(&query, sink).await })
            }
            ObjectSetSpec::Explicit { targets } => {
                let targets = targets.clone();
                let segment = bucket.content.clone();
                tokio::spawn(async move { Ok(stream_explicit_targets(&targets, &segment, sink).await) })
            }
        }
    }

    /// Run every item of `bucket` through `handler`, recording into `statistics`
    #[instrument(skip_all, fields(
        task_id = %bucket.task_id,
        activity_path = %bucket.activity_path,
        sequence_number = bucket.sequence_number,
    ))]
    pub async fn process(
        &self,
        bucket: &ClaimedBucket,
        work: &WorkDefinition,
        handler: Arc<dyn ItemHandler>,
        context: HandlerContext,
        statistics: Arc<StatisticsAggregator>,
        cancel: &CancellationToken,
    ) -> BucketRunReport {
        let concurrency = self.concurrency_for(work);
        let capacity = concurrency.saturating_mul(self.config.queue_factor.max(1));
        let (sink, mut queue) = mpsc::channel(capacity);
        let producer = self.spawn_producer(bucket, work, sink);

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let control = Arc::new(RunControl::default());
        let context = Arc::new(context);
        let mut workers = JoinSet::new();
        let mut dispatched = 0u64;
        let mut interrupted = false;

        debug!(concurrency = concurrency, queue_capacity = capacity, "Processing bucket");

        loop {
            if control.stopped() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                item = queue.recv() => item,
            };
            let Some(item) = next else { break };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            // a worker may have failed while we waited for the permit
            if control.stopped() {
                break;
            }

            let request = ItemProcessingRequest {
                sequence_number: dispatched,
                item,
                bucket_sequence_number: bucket.sequence_number,
                task_id: bucket.task_id,
                activity_path: bucket.activity_path.clone(),
                attempt: 0,
            };
            dispatched += 1;

            let worker = ItemWorker {
                handler: handler.clone(),
                context: context.clone(),
                policy: work.error_policy,
                backoff: self.backoff.clone(),
                statistics: statistics.clone(),
                control: control.clone(),
                cancel: cancel.clone(),
            };
            workers.spawn(async move {
                worker.run(request).await;
                drop(permit);
            });

            while let Some(finished) = workers.try_join_next() {
                if let Err(join_error) = finished {
                    error!(error = %join_error, "Item worker task failed");
                }
            }
        }

        // closing the queue ends the producer early if we stopped before the end
        drop(queue);
        while let Some(finished) = workers.join_next().await {
            if let Err(join_error) = finished {
                error!(error = %join_error, "Item worker task failed");
            }
        }

        let source_error = match producer.await {
            Ok(Ok(streamed)) => {
                debug!(items_streamed = streamed, "Object stream finished");
                None
            }
            Ok(Err(source_error)) => {
                warn!(error = %source_error, "Object stream failed");
                statistics.record_error(&source_error.to_string());
                Some(source_error)
            }
            Err(join_error) => {
                let source_error = SourceError::Permanent(format!("object stream task failed: {join_error}"));
                statistics.record_error(&source_error.to_string());
                Some(source_error)
            }
        };

        let aborted = control.abort_reason.lock().take();
        let unavailable = control.unavailable.lock().take();
        BucketRunReport {
            statistics: statistics.finish(),
            aborted,
            interrupted,
            source_error,
            unavailable,
            items_dispatched: dispatched,
        }
    }
}

/// Everything one spawned item needs
struct ItemWorker {
    handler: Arc<dyn ItemHandler>,
    context: Arc<HandlerContext>,
    policy: ErrorPolicy,
    backoff: BackoffCalculator,
    statistics: Arc<StatisticsAggregator>,
    control: Arc<RunControl>,
    cancel: CancellationToken,
}

impl ItemWorker {
    async fn invoke(&self, request: &ItemProcessingRequest) -> ItemOutcome {
        match AssertUnwindSafe(self.handler.handle(request, &self.context))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => ItemOutcome::failure(format!("handler '{}' panicked", self.handler.name()), false),
        }
    }

    async fn run(&self, mut request: ItemProcessingRequest) {
        loop {
            let outcome = self.invoke(&request).await;
            let (reason, retryable) = match outcome {
                ItemOutcome::Success => {
                    self.statistics.record_success();
                    return;
                }
                ItemOutcome::Skip => {
                    self.statistics.record_skip();
                    return;
                }
                ItemOutcome::Failure { reason, retryable } => (reason, retryable),
                ItemOutcome::Unavailable { reason } => {
                    warn!(item = %request.item.oid, reason = %reason, "Downstream system unavailable, halting bucket");
                    self.statistics.record_error(&reason);
                    self.control.halt_unavailable(reason);
                    return;
                }
            };

            match self.policy {
                ErrorPolicy::StopOnError => {
                    self.statistics.record_failure(&request.item.oid, &reason);
                    self.control
                        .abort(format!("item {} failed: {}", request.item.oid, reason));
                    return;
                }
                ErrorPolicy::ContinueOnError { max_retries } => {
                    if retryable && request.attempt < max_retries {
                        self.statistics.record_retry();
                        let delay = self.backoff.delay_for_attempt(request.attempt);
                        debug!(
                            item = %request.item.oid,
                            attempt = request.attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying item"
                        );
                        tokio::select! {
                            // abandoned; the bucket is released and reprocessed later
                            _ = self.cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        request.attempt += 1;
                        continue;
                    }
                    self.statistics.record_failure(&request.item.oid, &reason);
                    return;
                }
            }
        }
    }
}
