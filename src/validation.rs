//! Submission-time validation of activity trees.
//!
//! Everything checked here would otherwise surface mid-run as a failed bucket, so
//! a tree is rejected before its task envelope is ever written.

use std::collections::HashSet;

use crate::constants::system::{MAX_ACTIVITY_TREE_DEPTH, MAX_IDENTIFIER_LENGTH, PATH_SEPARATOR};
use crate::error::{EngineError, EngineResult};
use crate::models::{ActivityNode, ActivityPath, BucketingStrategy, ObjectSetSpec, WorkDefinition};
use crate::registry::HandlerRegistry;

fn invalid(path: &ActivityPath, message: impl std::fmt::Display) -> EngineError {
    EngineError::Validation(format!("activity '{path}': {message}"))
}

fn validate_identifier(path: &ActivityPath, identifier: &str) -> EngineResult<()> {
    if identifier.trim().is_empty() {
        return Err(invalid(path, "identifier must not be empty"));
    }
    if identifier.len() > MAX_IDENTIFIER_LENGTH {
        return Err(invalid(
            path,
            format!("identifier longer than {MAX_IDENTIFIER_LENGTH} characters"),
        ));
    }
    if identifier.contains(PATH_SEPARATOR) {
        return Err(invalid(path, format!("identifier must not contain '{PATH_SEPARATOR}'")));
    }
    Ok(())
}

fn validate_work(path: &ActivityPath, work: &WorkDefinition, registry: &HandlerRegistry) -> EngineResult<()> {
    if !registry.contains(&work.handler_id) {
        return Err(invalid(path, format!("no handler registered as '{}'", work.handler_id)));
    }

    if let ObjectSetSpec::Query { object_type, .. } = &work.object_set {
        if object_type.trim().is_empty() {
            return Err(invalid(path, "object type must not be empty"));
        }
    }

    match &work.bucketing {
        BucketingStrategy::NumericInterval { size: 0 } => {
            return Err(invalid(path, "interval size must be greater than 0"));
        }
        BucketingStrategy::FilterSegmentation { segments: 0, .. } => {
            return Err(invalid(path, "segment count must be greater than 0"));
        }
        BucketingStrategy::FilterSegmentation { partition_key, .. } if partition_key.is_empty() => {
            return Err(invalid(path, "partition key must not be empty"));
        }
        BucketingStrategy::ExplicitValueSet { property, .. } if property.is_empty() => {
            return Err(invalid(path, "value set property must not be empty"));
        }
        BucketingStrategy::ExplicitValueSet { values, .. } => {
            // each value is one bucket; a repeated value would cover its objects twice
            if let Some((index, value)) = values
                .iter()
                .enumerate()
                .find(|(index, value)| values[..*index].contains(*value))
            {
                return Err(invalid(
                    path,
                    format!("value set repeats {value} at position {index}"),
                ));
            }
        }
        _ => {}
    }

    if work.concurrency == Some(0) {
        return Err(invalid(path, "concurrency must be greater than 0"));
    }
    Ok(())
}

fn validate_node(
    path: &ActivityPath,
    node: &ActivityNode,
    registry: &HandlerRegistry,
) -> EngineResult<()> {
    validate_identifier(path, &node.identifier)?;

    if path.depth() > MAX_ACTIVITY_TREE_DEPTH {
        return Err(invalid(path, format!("tree deeper than {MAX_ACTIVITY_TREE_DEPTH} levels")));
    }
    if node.work.is_none() && node.children.is_empty() {
        return Err(invalid(path, "node has neither work nor children"));
    }
    if let Some(work) = &node.work {
        validate_work(path, work, registry)?;
    }

    let mut seen = HashSet::new();
    for child in &node.children {
        if !seen.insert(child.identifier.as_str()) {
            return Err(invalid(path, format!("duplicate child identifier '{}'", child.identifier)));
        }
        validate_node(&path.child(child.identifier.clone()), child, registry)?;
    }
    Ok(())
}

/// Check a whole tree against structural limits and the handler registry
pub fn validate_activity_tree(root: &ActivityNode, registry: &HandlerRegistry) -> EngineResult<()> {
    validate_node(&ActivityPath::root(root.identifier.clone()), root, registry)
}
