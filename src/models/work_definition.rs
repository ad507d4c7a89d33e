//! Declarative description of what an activity processes and how it is split.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::object::{ObjectFilter, ObjectRef};

/// The set of objects an activity iterates over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectSetSpec {
    /// Objects of one type matching a filter, resolved against the object source
    Query {
        object_type: String,
        #[serde(default)]
        filter: ObjectFilter,
    },
    /// A fixed list of targets; the object source is not consulted
    Explicit { targets: Vec<ObjectRef> },
}

/// How the object set is partitioned into buckets
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BucketingStrategy {
    /// One implicit bucket covering everything
    #[default]
    None,
    /// Contiguous position ranges of `size` items
    NumericInterval { size: u64 },
    /// One bucket per listed value of `property`
    ExplicitValueSet { property: String, values: Vec<Value> },
    /// `segments` buckets, each owning the objects whose `partition_key` hashes to its index
    FilterSegmentation { partition_key: String, segments: u32 },
}

/// Per-item failure handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// First failure stops dispatch, fails the bucket and the activity
    StopOnError,
    /// Retry retryable failures up to `max_retries` times, then count and move on
    ContinueOnError { max_retries: u32 },
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::ContinueOnError { max_retries: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Full,
    /// Handlers evaluate but do not apply changes
    DryRun,
}

/// Work an activity node performs over its object set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkDefinition {
    pub object_set: ObjectSetSpec,
    #[serde(default)]
    pub bucketing: BucketingStrategy,
    pub handler_id: String,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    /// Worker count for this activity; the pool default applies when unset
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
}

impl WorkDefinition {
    pub fn query(
        object_type: impl Into<String>,
        filter: ObjectFilter,
        handler_id: impl Into<String>,
    ) -> Self {
        Self::new(
            ObjectSetSpec::Query {
                object_type: object_type.into(),
                filter,
            },
            handler_id,
        )
    }

    pub fn explicit(targets: Vec<ObjectRef>, handler_id: impl Into<String>) -> Self {
        Self::new(ObjectSetSpec::Explicit { targets }, handler_id)
    }

    fn new(object_set: ObjectSetSpec, handler_id: impl Into<String>) -> Self {
        Self {
            object_set,
            bucketing: BucketingStrategy::None,
            handler_id: handler_id.into(),
            error_policy: ErrorPolicy::default(),
            concurrency: None,
            execution_mode: ExecutionMode::Full,
        }
    }

    pub fn with_bucketing(mut self, bucketing: BucketingStrategy) -> Self {
        self.bucketing = bucketing;
        self
    }

    pub fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_execution_mode(mut self, execution_mode: ExecutionMode) -> Self {
        self.execution_mode = execution_mode;
        self
    }

    pub fn object_type(&self) -> Option<&str> {
        match &self.object_set {
            ObjectSetSpec::Query { object_type, .. } => Some(object_type),
            ObjectSetSpec::Explicit { .. } => None,
        }
    }
}
