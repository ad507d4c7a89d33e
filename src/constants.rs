//! # System Constants
//!
//! Event names published by the engine and the defaults backing
//! [`crate::config::ActivityEngineConfig`].

/// Lifecycle events published through [`crate::events::EventPublisher`]
pub mod events {
    // Task lifecycle events
    pub const TASK_SUBMITTED: &str = "task.submitted";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_SUSPENDED: &str = "task.suspended";
    pub const TASK_RESUMED: &str = "task.resumed";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_RESCHEDULED: &str = "task.rescheduled";
    pub const TASK_DELETED: &str = "task.deleted";

    // Activity lifecycle events
    pub const ACTIVITY_STARTED: &str = "activity.started";
    pub const ACTIVITY_COMPLETED: &str = "activity.completed";
    pub const ACTIVITY_FAILED: &str = "activity.failed";
    pub const ACTIVITY_SUSPENDED: &str = "activity.suspended";

    // Bucket events
    pub const BUCKET_CLAIMED: &str = "bucket.claimed";
    pub const BUCKET_COMPLETED: &str = "bucket.completed";
    pub const BUCKET_FAILED: &str = "bucket.failed";
    pub const BUCKET_RELEASED: &str = "bucket.released";
}

/// Built-in configuration defaults
pub mod defaults {
    pub const POLL_INTERVAL_MS: u64 = 500;
    pub const MAX_CLAIM_ATTEMPTS: u32 = 10;
    pub const CLAIM_TIMEOUT_SECONDS: u64 = 300;
    pub const HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
    pub const AUTO_RESUME_DELAY_SECONDS: u64 = 60;
    pub const WORKER_CONCURRENCY: usize = 4;
    pub const QUEUE_FACTOR: usize = 2;
    pub const RECENT_FAILURE_LIMIT: usize = 20;
    pub const EVENT_CHANNEL_CAPACITY: usize = 1000;
    pub const MAX_CONCURRENT_TASKS: usize = 8;
}

/// Structural limits enforced at submission
pub mod system {
    pub const MAX_ACTIVITY_TREE_DEPTH: usize = 16;
    pub const MAX_IDENTIFIER_LENGTH: usize = 128;
    pub const PATH_SEPARATOR: char = '/';
}
