//! # Object Source
//!
//! Boundary to the object repository. The engine only needs two things from it:
//! stream the objects of a bucket into a bounded channel, and estimate how many
//! objects a query matches.

pub mod in_memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{BucketContent, ObjectFilter, ObjectRef};

pub use in_memory::InMemoryObjectSource;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    /// Expected to clear on its own (timeouts, connection loss)
    #[error("Transient object source error: {0}")]
    Transient(String),
    /// Retrying will not help (bad query, unknown type)
    #[error("Permanent object source error: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

/// What to stream: one object type, filtered, restricted to one bucket's content
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectQuery {
    pub object_type: String,
    pub filter: ObjectFilter,
    pub segment: BucketContent,
}

#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Push every matching object of the segment into `sink` in a stable order.
    ///
    /// Positions used by `NumericInterval` segments refer to that order over the
    /// whole filtered set. A closed `sink` ends the search early without error.
    /// Returns how many objects were sent.
    async fn search(&self, query: &ObjectQuery, sink: mpsc::Sender<ObjectRef>) -> Result<u64, SourceError>;

    /// Number of objects matching `filter`, or `None` when the source cannot tell
    async fn count_estimate(&self, object_type: &str, filter: &ObjectFilter) -> Result<Option<u64>, SourceError>;
}

/// Stream an explicit target list through the same segment semantics as a search
pub async fn stream_explicit_targets(
    targets: &[ObjectRef],
    segment: &BucketContent,
    sink: mpsc::Sender<ObjectRef>,
) -> u64 {
    let mut sent = 0;
    for (position, target) in targets.iter().enumerate() {
        if !segment.admits(position as u64, target) {
            continue;
        }
        if sink.send(target.clone()).await.is_err() {
            break;
        }
        sent += 1;
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_explicit_targets_respect_interval() {
        let targets: Vec<ObjectRef> = (0..5)
            .map(|i| ObjectRef::new(format!("t-{i}"), "user"))
            .collect();
        let (tx, mut rx) = mpsc::channel(10);
        let sent = stream_explicit_targets(
            &targets,
            &BucketContent::NumericInterval {
                from: 1,
                to: Some(3),
            },
            tx,
        )
        .await;
        assert_eq!(sent, 2);
        assert_eq!(rx.recv().await.map(|o| o.oid), Some("t-1".to_string()));
        assert_eq!(rx.recv().await.map(|o| o.oid), Some("t-2".to_string()));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_explicit_targets_stop_when_receiver_dropped() {
        let targets: Vec<ObjectRef> = (0..5)
            .map(|i| ObjectRef::new(format!("t-{i}"), "user"))
            .collect();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert_eq!(stream_explicit_targets(&targets, &BucketContent::All, tx).await, 0);
    }
}
