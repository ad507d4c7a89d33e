//! External connector boundary and an in-memory implementation.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::models::ObjectRef;

/// A change recorded against an object that still has to reach the external system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub operation_id: String,
    pub kind: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl PendingOperation {
    pub fn new(operation_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            kind: kind.into(),
            attributes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied,
    /// The external system already had the change; nothing was done
    AlreadyApplied,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectorError {
    #[error("Transient connector error: {0}")]
    Transient(String),
    #[error("Permanent connector error: {0}")]
    Permanent(String),
}

impl ConnectorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::Transient(_))
    }
}

#[async_trait]
pub trait ExternalConnector: Send + Sync {
    async fn read_pending(&self, object: &ObjectRef) -> Result<Vec<PendingOperation>, ConnectorError>;

    /// Apply one pending operation. A failed apply leaves the operation pending.
    async fn apply(&self, object: &ObjectRef, operation: &PendingOperation) -> Result<ApplyOutcome, ConnectorError>;
}

/// Connector over in-process maps: the local pending queue and the remote state
#[derive(Debug, Default)]
pub struct InMemoryConnector {
    pending: Mutex<HashMap<String, Vec<PendingOperation>>>,
    remote: Mutex<HashSet<(String, String)>>,
    read_failures: Mutex<VecDeque<ConnectorError>>,
    apply_failures: Mutex<VecDeque<ConnectorError>>,
    applied: AtomicU64,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pending(&self, oid: &str, operation: PendingOperation) {
        self.pending
            .lock()
            .entry(oid.to_string())
            .or_default()
            .push(operation);
    }

    /// Mark an operation as present on the external system already
    pub fn mark_applied_remotely(&self, oid: &str, operation_id: &str) {
        self.remote
            .lock()
            .insert((oid.to_string(), operation_id.to_string()));
    }

    pub fn pending_for(&self, oid: &str) -> Vec<PendingOperation> {
        self.pending.lock().get(oid).cloned().unwrap_or_default()
    }

    pub fn is_applied_remotely(&self, oid: &str, operation_id: &str) -> bool {
        self.remote
            .lock()
            .contains(&(oid.to_string(), operation_id.to_string()))
    }

    /// Operations this connector actually applied (excludes already-applied no-ops)
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn fail_next_read(&self, error: ConnectorError) {
        self.read_failures.lock().push_back(error);
    }

    pub fn fail_next_apply(&self, error: ConnectorError) {
        self.apply_failures.lock().push_back(error);
    }

    fn clear_pending(&self, oid: &str, operation_id: &str) {
        let mut pending = self.pending.lock();
        if let Some(operations) = pending.get_mut(oid) {
            operations.retain(|op| op.operation_id != operation_id);
            if operations.is_empty() {
                pending.remove(oid);
            }
        }
    }
}

#[async_trait]
impl ExternalConnector for InMemoryConnector {
    async fn read_pending(&self, object: &ObjectRef) -> Result<Vec<PendingOperation>, ConnectorError> {
        let injected = self.read_failures.lock().pop_front();
        if let Some(error) = injected {
            return Err(error);
        }
        Ok(self.pending_for(&object.oid))
    }

    async fn apply(&self, object: &ObjectRef, operation: &PendingOperation) -> Result<ApplyOutcome, ConnectorError> {
        let injected = self.apply_failures.lock().pop_front();
        if let Some(error) = injected {
            return Err(error);
        }

        let newly_applied = self
            .remote
            .lock()
            .insert((object.oid.clone(), operation.operation_id.clone()));
        self.clear_pending(&object.oid, &operation.operation_id);

        if newly_applied {
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(ApplyOutcome::Applied)
        } else {
            Ok(ApplyOutcome::AlreadyApplied)
        }
    }
}
