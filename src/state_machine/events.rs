use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events that can trigger activity state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ActivityEvent {
    /// Begin driving the node
    Start,
    /// Own buckets and children are done
    Complete,
    /// Pause the node; claims are released by the caller
    Suspend,
    /// Continue a suspended node
    Resume,
    /// Mark node as failed with a reason
    Fail(String),
    /// Clear progress for a fresh run of a recurring task
    Reset,
}

impl ActivityEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Fail(_) => "fail",
            Self::Reset => "reset",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Events that can trigger task lifecycle transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskEvent {
    /// An execution node takes ownership
    Claim(String),
    /// The owning node gives the task back without finishing it
    Release,
    /// Park until the given time (recurring schedules)
    Wait(DateTime<Utc>),
    /// A waiting task becomes due
    Wake,
    Suspend,
    Resume,
    /// The root activity completed
    Finish,
    /// The root activity failed
    Fail(String),
    Cancel,
}

impl TaskEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Claim(_) => "claim",
            Self::Release => "release",
            Self::Wait(_) => "wait",
            Self::Wake => "wake",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Finish => "finish",
            Self::Fail(_) => "fail",
            Self::Cancel => "cancel",
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish | Self::Fail(_) | Self::Cancel)
    }
}
