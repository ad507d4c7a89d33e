//! # Item Execution
//!
//! The per-item handler contract, retry backoff and the bounded worker pool that
//! runs one claimed bucket.

pub mod item;
pub mod retry;
pub mod worker_pool;

pub use item::{handler_fn, FnHandler, HandlerContext, ItemHandler, ItemOutcome, ItemProcessingRequest};
pub use retry::BackoffCalculator;
pub use worker_pool::{BucketRunReport, WorkerPool};
