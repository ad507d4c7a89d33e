#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Activity Engine
//!
//! Resumable, bucketed execution of long-running bulk activities over large
//! object sets (recomputation, reconciliation, propagation to external systems).
//!
//! ## Overview
//!
//! A task is a tree of activities. Each activity with work streams its object set
//! from an [`source::ObjectSource`], lazily partitioned into buckets that any
//! number of execution nodes claim through an optimistic compare-and-swap on the
//! task record. Every item of a claimed bucket goes through a registered
//! [`execution::ItemHandler`] on a bounded worker pool, and progress is persisted
//! at bucket granularity, so a suspended or crashed run resumes where it stopped.
//!
//! ## Architecture
//!
//! ```text
//! TaskManager ──claim──▶ ActivityExecutor ──▶ BucketManager ──CAS──▶ TaskStore
//!      │                       │
//!      │                       └──▶ WorkerPool ──▶ ItemHandler ──▶ ExternalConnector
//!      └── suspend / resume / cancel / progress
//! ```
//!
//! ## Module Organization
//!
//! - [`models`] - Activity tree, work definitions, buckets and the task envelope
//! - [`state_machine`] - Activity and task lifecycle transition tables
//! - [`buckets`] - Discovery, claiming and reaping of buckets
//! - [`execution`] - Handler contract, retry backoff and the worker pool
//! - [`orchestration`] - Activity executor and the task manager
//! - [`persistence`] - Task store boundary with in-memory and PostgreSQL stores
//! - [`source`] - Object source boundary
//! - [`handlers`] - External connector boundary and the propagation activity
//! - [`resilience`] - Circuit breakers for external calls
//! - [`statistics`] - Operation statistics and progress snapshots
//! - [`config`] - Layered configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use activity_engine::config::ActivityEngineConfig;
//! use activity_engine::execution::{handler_fn, ItemOutcome};
//! use activity_engine::models::{ActivityNode, BucketingStrategy, ObjectFilter, ObjectRef, Schedule, WorkDefinition};
//! use activity_engine::orchestration::TaskManager;
//! use activity_engine::persistence::InMemoryTaskStore;
//! use activity_engine::registry::HandlerRegistry;
//! use activity_engine::source::InMemoryObjectSource;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! activity_engine::logging::init_structured_logging();
//!
//! let source = InMemoryObjectSource::with_objects(
//!     (0..100).map(|i| ObjectRef::new(format!("user-{i}"), "user")),
//! );
//! let registry = HandlerRegistry::new()
//!     .with_handler("recompute", Arc::new(handler_fn("recompute", |_, _| ItemOutcome::Success)))?;
//!
//! let manager = TaskManager::new(
//!     ActivityEngineConfig::default(),
//!     Arc::new(InMemoryTaskStore::new()),
//!     Arc::new(source),
//!     registry,
//! )?;
//!
//! let work = WorkDefinition::query("user", ObjectFilter::All, "recompute")
//!     .with_bucketing(BucketingStrategy::NumericInterval { size: 25 });
//! let task_id = manager
//!     .submit("recompute users", ActivityNode::leaf("recompute", work), Schedule::once())
//!     .await?;
//! manager.run_task(task_id).await?;
//!
//! let progress = manager.get_progress(task_id).await?;
//! println!("processed {} items", progress.totals.items_processed);
//! # Ok(())
//! # }
//! ```

pub mod buckets;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod execution;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod registry;
pub mod resilience;
pub mod source;
pub mod state_machine;
pub mod statistics;
pub mod validation;

pub use config::{ActivityEngineConfig, BackoffConfig, ConfigManager, DatabaseConfig, EngineConfig, WorkerPoolConfig};
pub use error::{EngineError, EngineResult};
pub use events::{EventPublisher, PublishedEvent};
pub use execution::{handler_fn, HandlerContext, ItemHandler, ItemOutcome, ItemProcessingRequest};
pub use models::{
    ActivityNode, ActivityPath, BucketingStrategy, CompositionPolicy, ErrorPolicy, ExecutionMode,
    ObjectFilter, ObjectRef, Schedule, TaskEnvelope, TaskResultStatus, WorkDefinition,
};
pub use orchestration::{ActivityExecutor, ActivityRunOutcome, TaskManager, TaskRunOutcome};
pub use persistence::{InMemoryTaskStore, PgTaskStore, TaskStore};
pub use registry::HandlerRegistry;
pub use source::{InMemoryObjectSource, ObjectSource};
pub use state_machine::{ActivityState, TaskLifecycleState};
pub use statistics::{OperationStatistics, ProgressSnapshot};
