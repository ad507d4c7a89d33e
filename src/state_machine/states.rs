use serde::{Deserialize, Serialize};
use std::fmt;

/// Realization state of one activity node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    /// Node has not been started yet
    #[default]
    NotStarted,
    /// Node is claiming buckets or running children
    InProgress,
    /// Own buckets and all children completed
    Complete,
    /// Paused; claims released, resumable
    Suspended,
    /// Aborted by an error policy, a failed child or a permanent infrastructure error
    Failed,
}

impl ActivityState {
    /// Check if this is a terminal state (no further transitions allowed except reset)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Check if this is an active state (node is being driven)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress)
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Complete => write!(f, "complete"),
            Self::Suspended => write!(f, "suspended"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ActivityState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "suspended" => Ok(Self::Suspended),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid activity state: {s}")),
        }
    }
}

/// Lifecycle state of a task envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLifecycleState {
    /// Eligible to be claimed by an execution node
    #[default]
    Runnable,
    /// Waiting for `not_before` or the next recurring run
    Waiting,
    /// Owned and driven by `execution_node_id`
    Running,
    /// Paused by an operator or by a transient infrastructure error
    Suspended,
    /// Finished, failed or cancelled
    Closed,
}

impl TaskLifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// States a scheduler pass has to look at
    pub fn schedulable() -> &'static [TaskLifecycleState] {
        &[Self::Runnable, Self::Waiting, Self::Suspended]
    }

    /// Every state except `Closed`
    pub fn open() -> &'static [TaskLifecycleState] {
        &[Self::Runnable, Self::Waiting, Self::Running, Self::Suspended]
    }
}

impl fmt::Display for TaskLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runnable => write!(f, "runnable"),
            Self::Waiting => write!(f, "waiting"),
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for TaskLifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "runnable" => Ok(Self::Runnable),
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid task lifecycle state: {s}")),
        }
    }
}
