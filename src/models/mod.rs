//! # Data Model
//!
//! Serializable types persisted inside a task record: the activity tree, its
//! work definitions, bucket bookkeeping and the task envelope around them.

pub mod activity;
pub mod bucket;
pub mod object;
pub mod task;
pub mod work_definition;

pub use activity::{ActivityNode, ActivityPath, ActivityWorkState, CompositionPolicy};
pub use bucket::{Bucket, BucketContent, BucketCounts, BucketState, BucketingState};
pub use object::{ObjectFilter, ObjectRef};
pub use task::{ControlRequest, Recurrence, Schedule, TaskEnvelope, TaskResultStatus};
pub use work_definition::{
    BucketingStrategy, ErrorPolicy, ExecutionMode, ObjectSetSpec, WorkDefinition,
};
