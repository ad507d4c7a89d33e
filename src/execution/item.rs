//! Per-item handler contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::{ActivityPath, ExecutionMode, ObjectRef};

/// One object handed to a handler; ephemeral, never persisted
#[derive(Debug, Clone, PartialEq)]
pub struct ItemProcessingRequest {
    /// Position of the item within its bucket run, starting at 0
    pub sequence_number: u64,
    pub item: ObjectRef,
    pub bucket_sequence_number: u64,
    pub task_id: Uuid,
    pub activity_path: ActivityPath,
    /// 0 on the first attempt, incremented per retry
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Success,
    Skip,
    Failure { reason: String, retryable: bool },
    /// A system the handler depends on is unreachable. Not a verdict on the item:
    /// the bucket is given back and the task suspends itself for a later resume.
    Unavailable { reason: String },
}

impl ItemOutcome {
    pub fn failure(reason: impl Into<String>, retryable: bool) -> Self {
        ItemOutcome::Failure {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        ItemOutcome::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success)
    }
}

/// What a handler knows about the activity it runs under
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerContext {
    pub task_id: Uuid,
    pub activity_path: ActivityPath,
    pub execution_mode: ExecutionMode,
}

/// Business logic of one activity kind, applied to each object of its object set.
///
/// Handlers must tolerate seeing the same object twice: a bucket interrupted by
/// suspension or a crash is processed again from its start.
#[async_trait]
pub trait ItemHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, request: &ItemProcessingRequest, context: &HandlerContext) -> ItemOutcome;
}

/// Adapter turning a plain closure into an [`ItemHandler`]
pub struct FnHandler<F> {
    name: String,
    handler: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> ItemHandler for FnHandler<F>
where
    F: Fn(&ItemProcessingRequest, &HandlerContext) -> ItemOutcome + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, request: &ItemProcessingRequest, context: &HandlerContext) -> ItemOutcome {
        (self.handler)(request, context)
    }
}

pub fn handler_fn<F>(name: impl Into<String>, handler: F) -> FnHandler<F>
where
    F: Fn(&ItemProcessingRequest, &HandlerContext) -> ItemOutcome + Send + Sync,
{
    FnHandler {
        name: name.into(),
        handler,
    }
}
