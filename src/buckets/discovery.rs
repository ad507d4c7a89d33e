//! Lazy bucket discovery.
//!
//! Each call appends the next batch of buckets for a work definition to its
//! [`BucketingState`]. Interval strategies discover one bucket per call; value
//! sets and segmentations enumerate all of theirs at once.

use tracing::debug;

use crate::models::{BucketContent, BucketingState, BucketingStrategy, ObjectSetSpec, WorkDefinition};
use crate::source::{ObjectSource, SourceError};

/// Item count for the whole object set, taken once per activity run
async fn estimate(work: &WorkDefinition, source: &dyn ObjectSource) -> Result<Option<u64>, SourceError> {
    match &work.object_set {
        ObjectSetSpec::Query {
            object_type,
            filter,
        } => source.count_estimate(object_type, filter).await,
        ObjectSetSpec::Explicit { targets } => Ok(Some(targets.len() as u64)),
    }
}

/// Append the next discovered bucket(s); returns how many were appended.
///
/// A no-op once `fully_discovered` is set. A zero estimate finishes discovery
/// with no buckets at all; an unavailable estimate degrades to one `All` bucket.
pub async fn discover_next(
    work: &WorkDefinition,
    state: &mut BucketingState,
    source: &dyn ObjectSource,
) -> Result<usize, SourceError> {
    if state.fully_discovered {
        return Ok(0);
    }

    if !state.estimate_taken {
        state.estimated_total = estimate(work, source).await?;
        state.estimate_taken = true;
        debug!(estimated_total = ?state.estimated_total, "Object set size estimated");
    }

    if state.estimated_total == Some(0) {
        state.fully_discovered = true;
        return Ok(0);
    }

    let appended = match &work.bucketing {
        BucketingStrategy::None => {
            state.append(BucketContent::All);
            state.fully_discovered = true;
            1
        }
        BucketingStrategy::NumericInterval { size } => match state.estimated_total {
            None => {
                state.append(BucketContent::All);
                state.fully_discovered = true;
                1
            }
            Some(total) => {
                let from = state.discovery_cursor;
                let end = from.saturating_add((*size).max(1));
                // the last interval stays open so late arrivals are still covered
                let to = if end >= total { None } else { Some(end) };
                state.append(BucketContent::NumericInterval { from, to });
                state.discovery_cursor = end;
                if to.is_none() {
                    state.fully_discovered = true;
                }
                1
            }
        },
        BucketingStrategy::ExplicitValueSet { property, values } => {
            let mut appended = 0;
            for (index, value) in values.iter().enumerate() {
                if values[..index].contains(value) {
                    continue;
                }
                state.append(BucketContent::Value {
                    property: property.clone(),
                    value: value.clone(),
                });
                appended += 1;
            }
            state.fully_discovered = true;
            appended
        }
        BucketingStrategy::FilterSegmentation {
            partition_key,
            segments,
        } => {
            for index in 0..*segments {
                state.append(BucketContent::Segment {
                    key: partition_key.clone(),
                    index,
                    of: *segments,
                });
            }
            state.fully_discovered = true;
            *segments as usize
        }
    };

    Ok(appended)
}

/// Discover every bucket up front
#[cfg(test)]
pub(crate) async fn discover_all(
    work: &WorkDefinition,
    state: &mut BucketingState,
    source: &dyn ObjectSource,
) -> Result<usize, SourceError> {
    let mut total = 0;
    while !state.fully_discovered {
        total += discover_next(work, state, source).await?;
    }
    Ok(total)
}
