//! # Orchestration
//!
//! Drives task envelopes on this execution node: [`TaskManager`] owns the
//! lifecycle surface and scheduling, [`ActivityExecutor`] walks the activity
//! tree and runs bucket loops.

pub mod activity_executor;
pub mod task_manager;

pub use activity_executor::{ActivityExecutor, ActivityRunOutcome};
pub use task_manager::{TaskManager, TaskRunOutcome};
