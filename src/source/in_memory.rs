use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::{ObjectQuery, ObjectSource, SourceError};
use crate::models::{ObjectFilter, ObjectRef};

/// Object source over an in-process map, ordered by `(object_type, oid)`
#[derive(Debug)]
pub struct InMemoryObjectSource {
    objects: RwLock<BTreeMap<(String, String), ObjectRef>>,
    estimates_available: AtomicBool,
    search_failures: Mutex<VecDeque<SourceError>>,
    estimate_failures: Mutex<VecDeque<SourceError>>,
    searches: AtomicU64,
}

impl Default for InMemoryObjectSource {
    fn default() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            estimates_available: AtomicBool::new(true),
            search_failures: Mutex::new(VecDeque::new()),
            estimate_failures: Mutex::new(VecDeque::new()),
            searches: AtomicU64::new(0),
        }
    }
}

impl InMemoryObjectSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_objects(objects: impl IntoIterator<Item = ObjectRef>) -> Self {
        let source = Self::new();
        for object in objects {
            source.insert(object);
        }
        source
    }

    pub fn insert(&self, object: ObjectRef) {
        self.objects
            .write()
            .insert((object.object_type.clone(), object.oid.clone()), object);
    }

    pub fn remove(&self, object_type: &str, oid: &str) -> Option<ObjectRef> {
        self.objects
            .write()
            .remove(&(object_type.to_string(), oid.to_string()))
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// When disabled, `count_estimate` answers `None`
    pub fn set_estimates_available(&self, available: bool) {
        self.estimates_available.store(available, Ordering::SeqCst);
    }

    /// Queue an error returned by the next `search` call
    pub fn fail_next_search(&self, error: SourceError) {
        self.search_failures.lock().push_back(error);
    }

    /// Queue an error returned by the next `count_estimate` call
    pub fn fail_next_estimate(&self, error: SourceError) {
        self.estimate_failures.lock().push_back(error);
    }

    /// How many `search` calls were made
    pub fn search_count(&self) -> u64 {
        self.searches.load(Ordering::SeqCst)
    }

    fn matching(&self, object_type: &str, filter: &ObjectFilter) -> Vec<ObjectRef> {
        self.objects
            .read()
            .values()
            .filter(|object| object.object_type == object_type && filter.matches(object))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ObjectSource for InMemoryObjectSource {
    async fn search(&self, query: &ObjectQuery, sink: mpsc::Sender<ObjectRef>) -> Result<u64, SourceError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let injected = self.search_failures.lock().pop_front();
        if let Some(error) = injected {
            return Err(error);
        }

        // snapshot first; the lock must not be held across the sends
        let matching = self.matching(&query.object_type, &query.filter);

        let mut sent = 0;
        for (position, object) in matching.into_iter().enumerate() {
            if !query.segment.admits(position as u64, &object) {
                continue;
            }
            if sink.send(object).await.is_err() {
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }

    async fn count_estimate(&self, object_type: &str, filter: &ObjectFilter) -> Result<Option<u64>, SourceError> {
        let injected = self.estimate_failures.lock().pop_front();
        if let Some(error) = injected {
            return Err(error);
        }
        if !self.estimates_available.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(self.matching(object_type, filter).len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BucketContent;

    fn source() -> InMemoryObjectSource {
        InMemoryObjectSource::with_objects((0..6).map(|i| {
            ObjectRef::new(format!("user-{i:03}"), "user")
                .with_attribute("dept", if i % 2 == 0 { "eng" } else { "ops" })
        }))
    }

    async fn collect(source: &InMemoryObjectSource, query: ObjectQuery) -> Vec<String> {
        let (tx, mut rx) = mpsc::channel(16);
        source.search(&query, tx).await.unwrap();
        let mut oids = Vec::new();
        while let Some(object) = rx.recv().await {
            oids.push(object.oid);
        }
        oids
    }

    #[tokio::test]
    async fn test_search_positions_follow_filtered_order() {
        let source = source();
        let oids = collect(
            &source,
            ObjectQuery {
                object_type: "user".to_string(),
                filter: ObjectFilter::equals("dept", "eng"),
                segment: BucketContent::NumericInterval { from: 1, to: None },
            },
        )
        .await;
        // eng users are 000, 002, 004; position 0 is skipped
        assert_eq!(oids, vec!["user-002", "user-004"]);
    }

    #[tokio::test]
    async fn test_estimates() {
        let source = source();
        assert_eq!(
            source.count_estimate("user", &ObjectFilter::All).await,
            Ok(Some(6))
        );
        assert_eq!(source.count_estimate("role", &ObjectFilter::All).await, Ok(Some(0)));
        source.set_estimates_available(false);
        assert_eq!(source.count_estimate("user", &ObjectFilter::All).await, Ok(None));
    }

    #[tokio::test]
    async fn test_injected_search_failure_is_consumed_once() {
        let source = source();
        source.fail_next_search(SourceError::Transient("timeout".to_string()));
        let query = ObjectQuery {
            object_type: "user".to_string(),
            filter: ObjectFilter::All,
            segment: BucketContent::All,
        };
        let (tx, _rx) = mpsc::channel(16);
        assert!(source.search(&query, tx).await.is_err());
        assert_eq!(collect(&source, query).await.len(), 6);
        assert_eq!(source.search_count(), 2);
    }
}
