use thiserror::Error;

/// Errors raised by the activity and task state machines
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateMachineError {
    #[error("Invalid {entity} state transition from {from} on event '{event}'")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        event: String,
    },

    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
