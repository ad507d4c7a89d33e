//! Buckets: the unit of claimable work inside one activity.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::object::ObjectRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketState {
    Ready,
    Delegated,
    Complete,
    Failed,
}

impl BucketState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for BucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Delegated => write!(f, "delegated"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Which part of the object set a bucket covers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BucketContent {
    /// Every object in the set
    All,
    /// Positions `[from, to)` in the ordered object set; `to = None` is open-ended
    NumericInterval { from: u64, to: Option<u64> },
    /// Objects whose `property` equals `value`
    Value { property: String, value: Value },
    /// Objects whose `key` hashes to `index` modulo `of`
    Segment { key: String, index: u32, of: u32 },
}

impl BucketContent {
    /// Whether the object at `position` of the ordered object set belongs here
    pub fn admits(&self, position: u64, object: &ObjectRef) -> bool {
        match self {
            BucketContent::All => true,
            BucketContent::NumericInterval { from, to } => {
                position >= *from && to.map_or(true, |to| position < to)
            }
            BucketContent::Value { property, value } => {
                object.property(property).as_ref() == Some(value)
            }
            BucketContent::Segment { key, index, of } => {
                *of > 0 && segment_of(object.property(key).as_ref(), *of) == *index
            }
        }
    }

    /// Upper bound on items for bounded intervals
    pub fn expected_size(&self) -> Option<u64> {
        match self {
            BucketContent::NumericInterval { from, to: Some(to) } => Some(to.saturating_sub(*from)),
            _ => None,
        }
    }
}

/// Stable segment index of a partition-key value.
///
/// Uses FNV-1a over the value's canonical text so that segment membership
/// survives process restarts and toolchain upgrades. Missing values land in 0.
pub fn segment_of(value: Option<&Value>, segments: u32) -> u32 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let Some(value) = value else {
        return 0;
    };
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let hash = text.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    (hash % u64::from(segments.max(1))) as u32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub sequence_number: u64,
    pub content: BucketContent,
    pub state: BucketState,
    #[serde(default)]
    pub claim_token: Option<Uuid>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure: Option<String>,
}

impl Bucket {
    pub fn new(sequence_number: u64, content: BucketContent) -> Self {
        Self {
            sequence_number,
            content,
            state: BucketState::Ready,
            claim_token: None,
            claimed_by: None,
            claimed_at: None,
            failure: None,
        }
    }

    pub fn delegate(&mut self, node_id: &str, token: Uuid, now: DateTime<Utc>) {
        self.state = BucketState::Delegated;
        self.claim_token = Some(token);
        self.claimed_by = Some(node_id.to_string());
        self.claimed_at = Some(now);
    }

    /// Back to READY; the claim is forgotten
    pub fn release(&mut self) {
        self.state = BucketState::Ready;
        self.clear_claim();
    }

    pub fn complete(&mut self) {
        self.state = BucketState::Complete;
        self.clear_claim();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = BucketState::Failed;
        self.failure = Some(reason.into());
        self.clear_claim();
    }

    fn clear_claim(&mut self) {
        self.claim_token = None;
        self.claimed_by = None;
        self.claimed_at = None;
    }

    pub fn is_delegated_to(&self, node_id: &str) -> bool {
        self.state == BucketState::Delegated && self.claimed_by.as_deref() == Some(node_id)
    }

    pub fn is_held_with(&self, token: Uuid) -> bool {
        self.state == BucketState::Delegated && self.claim_token == Some(token)
    }

    pub fn is_claim_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.state == BucketState::Delegated
            && self.claimed_at.map_or(true, |claimed_at| now - claimed_at > timeout)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounts {
    pub total: usize,
    pub ready: usize,
    pub delegated: usize,
    pub complete: usize,
    pub failed: usize,
}

/// Bucket bookkeeping persisted inside an activity's work state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BucketingState {
    pub buckets: Vec<Bucket>,
    pub fully_discovered: bool,
    pub next_sequence_number: u64,
    /// Item count taken once at first discovery; `None` when unavailable
    #[serde(default)]
    pub estimated_total: Option<u64>,
    #[serde(default)]
    pub estimate_taken: bool,
    /// Next uncovered position for interval discovery
    #[serde(default)]
    pub discovery_cursor: u64,
}

impl BucketingState {
    /// Append a newly discovered bucket; sequence numbers are never reused
    pub fn append(&mut self, content: BucketContent) -> u64 {
        let sequence_number = self.next_sequence_number;
        self.buckets.push(Bucket::new(sequence_number, content));
        self.next_sequence_number += 1;
        sequence_number
    }

    /// Index of a bucket this node may claim.
    ///
    /// A bucket still delegated to `node_id` is reclaimed only when `in_flight`
    /// says no local caller holds it (the claim predates a restart); otherwise
    /// the first READY bucket that no local caller has just claimed from a
    /// newer version.
    pub fn next_claimable<F>(&self, node_id: &str, in_flight: F) -> Option<usize>
    where
        F: Fn(u64) -> bool,
    {
        self.buckets
            .iter()
            .position(|b| b.is_delegated_to(node_id) && !in_flight(b.sequence_number))
            .or_else(|| {
                self.buckets
                    .iter()
                    .position(|b| b.state == BucketState::Ready && !in_flight(b.sequence_number))
            })
    }

    pub fn position_of(&self, sequence_number: u64) -> Option<usize> {
        self.buckets
            .iter()
            .position(|b| b.sequence_number == sequence_number)
    }

    pub fn counts(&self) -> BucketCounts {
        let mut counts = BucketCounts {
            total: self.buckets.len(),
            ..BucketCounts::default()
        };
        for bucket in &self.buckets {
            match bucket.state {
                BucketState::Ready => counts.ready += 1,
                BucketState::Delegated => counts.delegated += 1,
                BucketState::Complete => counts.complete += 1,
                BucketState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn has_outstanding(&self) -> bool {
        self.buckets
            .iter()
            .any(|b| matches!(b.state, BucketState::Ready | BucketState::Delegated))
    }

    pub fn has_delegated(&self) -> bool {
        self.buckets
            .iter()
            .any(|b| b.state == BucketState::Delegated)
    }

    pub fn first_failure(&self) -> Option<&str> {
        self.buckets
            .iter()
            .find(|b| b.state == BucketState::Failed)
            .and_then(|b| b.failure.as_deref())
    }

    /// Release every bucket delegated to `node_id` that `in_flight` does not
    /// claim for a local caller; returns how many were released
    pub fn release_delegated_to<F>(&mut self, node_id: &str, in_flight: F) -> usize
    where
        F: Fn(u64) -> bool,
    {
        let mut released = 0;
        for bucket in self
            .buckets
            .iter_mut()
            .filter(|b| b.is_delegated_to(node_id) && !in_flight(b.sequence_number))
        {
            bucket.release();
            released += 1;
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interval_admits_half_open_range() {
        let object = ObjectRef::new("u-1", "user");
        let content = BucketContent::NumericInterval {
            from: 3,
            to: Some(6),
        };
        assert!(!content.admits(2, &object));
        assert!(content.admits(3, &object));
        assert!(content.admits(5, &object));
        assert!(!content.admits(6, &object));
        assert_eq!(content.expected_size(), Some(3));

        let open = BucketContent::NumericInterval { from: 6, to: None };
        assert!(open.admits(1_000_000, &object));
        assert_eq!(open.expected_size(), None);
    }

    #[test]
    fn test_value_content() {
        let object = ObjectRef::new("u-1", "user").with_attribute("region", "emea");
        let content = BucketContent::Value {
            property: "region".to_string(),
            value: json!("emea"),
        };
        assert!(content.admits(0, &object));
        let other = BucketContent::Value {
            property: "region".to_string(),
            value: json!("apac"),
        };
        assert!(!other.admits(0, &object));
    }

    #[test]
    fn test_segments_partition_objects() {
        let segments = 4;
        for i in 0..100 {
            let object = ObjectRef::new(format!("u-{i}"), "user");
            let owners = (0..segments)
                .filter(|index| {
                    BucketContent::Segment {
                        key: "oid".to_string(),
                        index: *index,
                        of: segments,
                    }
                    .admits(0, &object)
                })
                .count();
            assert_eq!(owners, 1, "object u-{i} must land in exactly one segment");
        }
    }

    #[test]
    fn test_segment_hash_is_stable() {
        assert_eq!(segment_of(Some(&json!("alice")), 8), segment_of(Some(&json!("alice")), 8));
        assert_eq!(segment_of(None, 8), 0);
    }

    #[test]
    fn test_claim_lifecycle() {
        let mut state = BucketingState::default();
        assert_eq!(state.append(BucketContent::All), 0);
        assert_eq!(state.append(BucketContent::All), 1);
        assert_eq!(state.next_sequence_number, 2);

        let token = Uuid::new_v4();
        state.buckets[0].delegate("node-a", token, Utc::now());
        assert!(state.buckets[0].is_held_with(token));
        // a stale claim of this node is reclaimed, one held locally is skipped
        assert_eq!(state.next_claimable("node-a", |_| false), Some(0));
        assert_eq!(state.next_claimable("node-a", |seq| seq == 0), Some(1));
        assert_eq!(state.next_claimable("node-b", |_| false), Some(1));

        assert_eq!(state.release_delegated_to("node-a", |seq| seq == 0), 0);
        assert_eq!(state.release_delegated_to("node-a", |_| false), 1);
        assert_eq!(state.buckets[0].state, BucketState::Ready);
        assert!(state.buckets[0].claim_token.is_none());
        // a READY snapshot of a bucket a local caller already holds is skipped
        assert_eq!(state.next_claimable("node-a", |seq| seq == 0), Some(1));

        state.buckets[1].fail("boom");
        assert_eq!(state.first_failure(), Some("boom"));
        let counts = state.counts();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.ready, 1);
        assert_eq!(counts.failed, 1);
    }

    #[test]
    fn test_claim_expiry() {
        let mut bucket = Bucket::new(0, BucketContent::All);
        let claimed_at = Utc::now() - Duration::seconds(120);
        bucket.delegate("node-a", Uuid::new_v4(), claimed_at);
        assert!(bucket.is_claim_expired(Utc::now(), Duration::seconds(60)));
        assert!(!bucket.is_claim_expired(Utc::now(), Duration::seconds(600)));
    }
}
