//! Task envelope: the persisted unit binding an activity tree to a schedule and an owner.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::activity::{ActivityNode, ActivityPath};
use crate::state_machine::TaskLifecycleState;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResultStatus {
    #[default]
    Unknown,
    InProgress,
    Success,
    /// Completed, but some items failed
    PartialError { failed_items: u64 },
    FatalError { reason: String },
    Cancelled,
    /// Self-suspended after a transient infrastructure error, awaiting automatic resume
    Deferred { reason: String },
}

impl fmt::Display for TaskResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Success => write!(f, "success"),
            Self::PartialError { failed_items } => write!(f, "partial_error({failed_items})"),
            Self::FatalError { reason } => write!(f, "fatal_error: {reason}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Deferred { reason } => write!(f, "deferred: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    #[default]
    Once,
    /// Re-run the whole tree `interval_seconds` after each completion
    Recurring { interval_seconds: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schedule {
    pub not_before: Option<DateTime<Utc>>,
    pub recurrence: Recurrence,
}

impl Schedule {
    pub fn once() -> Self {
        Self::default()
    }

    pub fn recurring(interval_seconds: u64) -> Self {
        Self {
            not_before: None,
            recurrence: Recurrence::Recurring { interval_seconds },
        }
    }

    pub fn starting_at(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }

    /// When the next recurring run is due, if this schedule recurs
    pub fn next_run_after(&self, finished_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.recurrence {
            Recurrence::Once => None,
            Recurrence::Recurring { interval_seconds } => {
                let seconds = i64::try_from(interval_seconds).unwrap_or(i64::MAX);
                Some(finished_at + Duration::seconds(seconds))
            }
        }
    }
}

/// Operator request picked up by the owning node between buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    Suspend,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: Uuid,
    pub name: String,
    pub root_activity: ActivityNode,
    pub schedule: Schedule,
    pub lifecycle_state: TaskLifecycleState,
    pub execution_node_id: Option<String>,
    pub result_status: TaskResultStatus,
    /// Optimistic lock; bumped by every store write
    pub version: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub auto_resume_at: Option<DateTime<Utc>>,
    pub control_request: Option<ControlRequest>,
    #[serde(default)]
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// New envelope; WAITING when `not_before` lies in the future, RUNNABLE otherwise
    pub fn new(name: impl Into<String>, root_activity: ActivityNode, schedule: Schedule) -> Self {
        let now = Utc::now();
        let waiting = schedule.not_before.is_some_and(|at| at > now);
        Self {
            task_id: Uuid::new_v4(),
            name: name.into(),
            root_activity,
            schedule,
            lifecycle_state: if waiting {
                TaskLifecycleState::Waiting
            } else {
                TaskLifecycleState::Runnable
            },
            execution_node_id: None,
            result_status: TaskResultStatus::Unknown,
            version: 0,
            next_run_at: if waiting { schedule.not_before } else { None },
            auto_resume_at: None,
            control_request: None,
            run_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn root_path(&self) -> ActivityPath {
        ActivityPath::root(self.root_activity.identifier.clone())
    }

    pub fn activity(&self, path: &ActivityPath) -> Option<&ActivityNode> {
        self.root_activity.find(path)
    }

    pub fn activity_mut(&mut self, path: &ActivityPath) -> Option<&mut ActivityNode> {
        self.root_activity.find_mut(path)
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle_state.is_terminal()
    }

    pub fn is_owned_by(&self, node_id: &str) -> bool {
        self.lifecycle_state == TaskLifecycleState::Running
            && self.execution_node_id.as_deref() == Some(node_id)
    }

    /// WAITING task whose next run is due
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.lifecycle_state == TaskLifecycleState::Waiting
            && self.next_run_at.map_or(true, |at| at <= now)
    }

    /// Self-suspended task whose automatic resume time has passed
    pub fn is_auto_resume_due(&self, now: DateTime<Utc>) -> bool {
        self.lifecycle_state == TaskLifecycleState::Suspended
            && self.auto_resume_at.is_some_and(|at| at <= now)
    }
}
