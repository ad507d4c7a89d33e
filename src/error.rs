//! Error types for the activity engine.
//!
//! Module-level errors (`StoreError`, `SourceError`, `StateMachineError`, ...) convert
//! into [`EngineError`] so callers of the lifecycle surface deal with one type.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigurationError;
use crate::handlers::ConnectorError;
use crate::persistence::StoreError;
use crate::resilience::CircuitBreakerError;
use crate::source::SourceError;
use crate::state_machine::StateMachineError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("Object source error: {0}")]
    Source(#[from] SourceError),
    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),
    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),
    #[error("Activity {path} not found in task {task_id}")]
    ActivityNotFound { task_id: Uuid, path: String },
    #[error("No handler registered for id '{0}'")]
    HandlerNotFound(String),
    #[error("Claim lost on bucket {sequence_number} of {path} in task {task_id}")]
    ClaimLost {
        task_id: Uuid,
        path: String,
        sequence_number: u64,
    },
    #[error("Gave up claiming a bucket of {path} in task {task_id} after {attempts} attempts")]
    ClaimContention {
        task_id: Uuid,
        path: String,
        attempts: u32,
    },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Circuit breaker error: {0}")]
    CircuitBreaker(String),
    /// Reported by an item handler whose downstream system is unreachable
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Infrastructure errors that are expected to clear on their own.
    ///
    /// The executor uses this to decide between self-suspension with automatic
    /// resume and failing the activity outright.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Persistence(e) => e.is_transient(),
            EngineError::Source(e) => e.is_transient(),
            EngineError::Connector(e) => e.is_transient(),
            EngineError::ClaimContention { .. } => true,
            EngineError::CircuitBreaker(_) => true,
            EngineError::ResourceUnavailable(_) => true,
            _ => false,
        }
    }

    /// Errors originating outside the engine (store, object source, connector).
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            EngineError::Persistence(_)
                | EngineError::Source(_)
                | EngineError::Connector(_)
                | EngineError::ClaimContention { .. }
                | EngineError::CircuitBreaker(_)
                | EngineError::ResourceUnavailable(_)
        )
    }
}

impl From<ConfigurationError> for EngineError {
    fn from(error: ConfigurationError) -> Self {
        EngineError::Configuration(error.to_string())
    }
}

impl<E: std::fmt::Display> From<CircuitBreakerError<E>> for EngineError {
    fn from(error: CircuitBreakerError<E>) -> Self {
        EngineError::CircuitBreaker(error.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Internal(format!("JSON serialization error: {error}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err: EngineError = SourceError::Transient("repository timeout".to_string()).into();
        assert!(err.is_transient());
        assert!(err.is_infrastructure());

        let err: EngineError = SourceError::Permanent("unknown object type".to_string()).into();
        assert!(!err.is_transient());
        assert!(err.is_infrastructure());

        let err = EngineError::ResourceUnavailable("circuit breaker open for ldap".to_string());
        assert!(err.is_transient());
        assert!(err.is_infrastructure());

        let err = EngineError::Validation("bad tree".to_string());
        assert!(!err.is_transient());
        assert!(!err.is_infrastructure());
    }

    #[test]
    fn test_display_preserves_origin_message() {
        let err: EngineError = StoreError::Unavailable("connection refused".to_string()).into();
        assert_eq!(
            err.to_string(),
            "Persistence error: Store unavailable: connection refused"
        );
    }
}
