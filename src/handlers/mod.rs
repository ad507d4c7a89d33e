//! # Activity Handlers
//!
//! The external connector boundary and the propagation activity built on it.

pub mod connector;
pub mod propagation;

pub use connector::{
    ApplyOutcome, ConnectorError, ExternalConnector, InMemoryConnector, PendingOperation,
};
pub use propagation::{
    propagation_work_definition, PropagationHandler, PropagationResult, PropagationTotals,
    PROPAGATION_HANDLER_ID, SHADOW_OBJECT_TYPE,
};
