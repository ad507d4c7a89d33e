//! # Buckets
//!
//! Lazy partitioning of an activity's object set and optimistic claiming of the
//! resulting buckets across execution nodes.

pub mod discovery;
pub mod manager;
pub mod reaper;

pub use discovery::discover_next;
pub use manager::{BucketAllocation, BucketManager, BucketManagerConfig, ClaimedBucket};
pub use reaper::{ClaimReaper, HeartbeatRegistry, NodeLiveness, ReapReport};
