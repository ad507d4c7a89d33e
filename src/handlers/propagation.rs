//! # Propagation Handler
//!
//! Pushes pending operations recorded against shadows to their external
//! resources. Each shadow is one item: read its pending operations from the
//! connector, then apply them in order. A failure leaves the remaining operations
//! pending for the next propagation run, so the activity never retries within a
//! run (`ContinueOnError { max_retries: 0 }`).
//!
//! Only permanent connector errors fail an item. An unreachable connector
//! (transient error or open circuit breaker) is reported as
//! [`ItemOutcome::Unavailable`], which suspends the task until the connector
//! is expected to be back.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::connector::{ApplyOutcome, ConnectorError, ExternalConnector};
use crate::execution::{HandlerContext, ItemHandler, ItemOutcome, ItemProcessingRequest};
use crate::models::{ErrorPolicy, ExecutionMode, ObjectFilter, ObjectRef, WorkDefinition};
use crate::resilience::{CircuitBreaker, CircuitBreakerError};

pub const PROPAGATION_HANDLER_ID: &str = "propagation";
pub const SHADOW_OBJECT_TYPE: &str = "shadow";

/// What happened to one shadow
#[derive(Debug, Clone, PartialEq)]
pub struct PropagationResult {
    pub pending_seen: u64,
    pub applied: u64,
    pub already_applied: u64,
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationTotals {
    pub pending_seen: u64,
    pub applied: u64,
    pub already_applied: u64,
}

/// Work definition propagating every shadow of the given resources
pub fn propagation_work_definition<S: AsRef<str>>(resource_oids: &[S]) -> WorkDefinition {
    let resources = resource_oids
        .iter()
        .map(|oid| Value::String(oid.as_ref().to_string()))
        .collect();
    WorkDefinition::query(
        SHADOW_OBJECT_TYPE,
        ObjectFilter::one_of("resource_oid", resources),
        PROPAGATION_HANDLER_ID,
    )
    .with_error_policy(ErrorPolicy::ContinueOnError { max_retries: 0 })
}

fn failure_outcome(error: CircuitBreakerError<ConnectorError>) -> ItemOutcome {
    match error {
        CircuitBreakerError::CircuitOpen { component } => {
            ItemOutcome::unavailable(format!("circuit breaker open for {component}"))
        }
        CircuitBreakerError::OperationFailed(error) if error.is_transient() => {
            ItemOutcome::unavailable(error.to_string())
        }
        CircuitBreakerError::OperationFailed(error) => ItemOutcome::failure(error.to_string(), false),
    }
}

pub struct PropagationHandler {
    connector: Arc<dyn ExternalConnector>,
    breaker: Arc<CircuitBreaker>,
    pending_seen: AtomicU64,
    applied: AtomicU64,
    already_applied: AtomicU64,
}

impl std::fmt::Debug for PropagationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationHandler")
            .field("breaker", &self.breaker.name())
            .field("totals", &self.totals())
            .finish()
    }
}

impl PropagationHandler {
    pub fn new(connector: Arc<dyn ExternalConnector>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            connector,
            breaker,
            pending_seen: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            already_applied: AtomicU64::new(0),
        }
    }

    /// Counters accumulated over every object this handler has seen
    pub fn totals(&self) -> PropagationTotals {
        PropagationTotals {
            pending_seen: self.pending_seen.load(Ordering::SeqCst),
            applied: self.applied.load(Ordering::SeqCst),
            already_applied: self.already_applied.load(Ordering::SeqCst),
        }
    }

    pub async fn propagate_object(&self, object: &ObjectRef, mode: ExecutionMode) -> PropagationResult {
        let mut result = PropagationResult {
            pending_seen: 0,
            applied: 0,
            already_applied: 0,
            outcome: ItemOutcome::Success,
        };

        let pending = match self
            .breaker
            .call_with(|| self.connector.read_pending(object), ConnectorError::is_transient)
            .await
        {
            Ok(pending) => pending,
            Err(error) => {
                result.outcome = failure_outcome(error);
                return result;
            }
        };
        result.pending_seen = pending.len() as u64;
        self.pending_seen.fetch_add(result.pending_seen, Ordering::SeqCst);

        if mode == ExecutionMode::DryRun {
            debug!(oid = %object.oid, pending = result.pending_seen, "Dry run, nothing applied");
            return result;
        }

        for operation in &pending {
            match self
                .breaker
                .call_with(
                    || self.connector.apply(object, operation),
                    ConnectorError::is_transient,
                )
                .await
            {
                Ok(ApplyOutcome::Applied) => {
                    result.applied += 1;
                    self.applied.fetch_add(1, Ordering::SeqCst);
                }
                Ok(ApplyOutcome::AlreadyApplied) => {
                    result.already_applied += 1;
                    self.already_applied.fetch_add(1, Ordering::SeqCst);
                }
                Err(error) => {
                    debug!(
                        oid = %object.oid,
                        operation_id = %operation.operation_id,
                        "Propagation stopped, remaining operations stay pending"
                    );
                    result.outcome = failure_outcome(error);
                    return result;
                }
            }
        }

        result
    }
}

#[async_trait]
impl ItemHandler for PropagationHandler {
    fn name(&self) -> &str {
        PROPAGATION_HANDLER_ID
    }

    async fn handle(&self, request: &ItemProcessingRequest, context: &HandlerContext) -> ItemOutcome {
        self.propagate_object(&request.item, context.execution_mode)
            .await
            .outcome
    }
}
